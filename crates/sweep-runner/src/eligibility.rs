//! Eligibility engine.
//!
//! Every (job, operation) pair is classified from scratch on each pass:
//!
//! - `satisfied`: all postconditions hold, nothing to do;
//! - `blocked`: some precondition fails;
//! - `eligible`: may be dispatched now;
//! - `errored`: a job-local problem (corrupt artifact, missing input) makes
//!   the pair ineligible until someone fixes the workspace.
//!
//! No state is stored between passes, so re-running a pass after a crash or
//! after another machine advanced a trajectory needs no synchronization.

use crate::catalog::{Catalog, Operation, Predicate};
use crate::error::JobError;
use crate::inputs::InputCheck;
use crate::progress::{read_progress, Progress};
use crate::registry::{JobDocument, JobRecord};
use serde::Serialize;
use std::path::PathBuf;

/// One job's record, document and progress, read once per pass.
#[derive(Debug)]
pub struct JobSnapshot {
    pub job: JobRecord,
    pub document: Result<JobDocument, JobError>,
    pub progress: Result<Progress, JobError>,
}

impl JobSnapshot {
    pub fn take(job: JobRecord, artifact: &str) -> Self {
        let document = job.document().map_err(|e| match e.downcast::<JobError>() {
            Ok(job_err) => job_err,
            Err(other) => JobError::CorruptDocument {
                path: job.document_path(),
                reason: other.to_string(),
            },
        });
        let progress = read_progress(&job.path(artifact));
        Self {
            job,
            document,
            progress,
        }
    }

    pub fn target(&self) -> Result<Option<u64>, &JobError> {
        self.document.as_ref().map(|d| d.steps)
    }
}

/// How the resumable operation should be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchMode {
    /// No checkpoint yet: run one-time setup, then simulate.
    Fresh,
    /// Continue from the latest checkpoint, skipping setup.
    Resume { checkpoint: PathBuf, step: u64 },
}

impl DispatchMode {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchMode::Fresh => "fresh",
            DispatchMode::Resume { .. } => "resume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OpStatus {
    Blocked { failed: String },
    Eligible { mode: DispatchMode },
    Satisfied,
    Errored { class: String, message: String },
}

impl OpStatus {
    pub fn is_eligible(&self) -> bool {
        matches!(self, OpStatus::Eligible { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            OpStatus::Blocked { .. } => "blocked",
            OpStatus::Eligible { .. } => "eligible",
            OpStatus::Satisfied => "satisfied",
            OpStatus::Errored { .. } => "errored",
        }
    }

    fn errored(err: &JobError) -> Self {
        OpStatus::Errored {
            class: err.class().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationStatus {
    pub operation: String,
    #[serde(flatten)]
    pub status: OpStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProblemReport {
    pub class: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub id: String,
    /// `-1` when not started; absent when progress could not be read.
    pub current_step: Option<i64>,
    pub target: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<ProblemReport>,
    pub operations: Vec<OperationStatus>,
}

pub struct Engine<'a> {
    catalog: &'a Catalog,
    inputs: Option<&'a InputCheck>,
}

impl<'a> Engine<'a> {
    pub fn new(catalog: &'a Catalog, inputs: Option<&'a InputCheck>) -> Self {
        Self { catalog, inputs }
    }

    pub fn holds<'s>(&self, pred: &Predicate, snap: &'s JobSnapshot) -> Result<bool, &'s JobError> {
        match pred {
            Predicate::Sampled => {
                let progress = snap.progress.as_ref()?;
                Ok(match snap.target()? {
                    Some(target) => progress.reached(target),
                    None => false,
                })
            }
            Predicate::Satisfied(name) => match self.catalog.get(name) {
                Some(op) => self.all_hold(&op.post, snap),
                None => Ok(false),
            },
            Predicate::File(name) => Ok(snap.job.has_file(name)),
            Predicate::Doc(key) => {
                let doc = snap.document.as_ref()?;
                Ok(doc.get(key).map(|v| truthy(&v)).unwrap_or(false))
            }
            Predicate::Param { name, equals } => Ok(snap
                .job
                .statepoint
                .get(name)
                .map(|v| values_match(v, equals))
                .unwrap_or(false)),
            Predicate::Not(inner) => self.holds(inner, snap).map(|b| !b),
        }
    }

    /// True iff the list is non-empty and every predicate holds.
    fn all_hold<'s>(&self, preds: &[Predicate], snap: &'s JobSnapshot) -> Result<bool, &'s JobError> {
        if preds.is_empty() {
            return Ok(false);
        }
        for pred in preds {
            if !self.holds(pred, snap)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn status(&self, op: &Operation, snap: &JobSnapshot) -> OpStatus {
        match self.all_hold(&op.post, snap) {
            Ok(true) => return OpStatus::Satisfied,
            Ok(false) => {}
            Err(e) => return OpStatus::errored(e),
        }
        for pred in &op.pre {
            match self.holds(pred, snap) {
                Ok(true) => {}
                Ok(false) => {
                    return OpStatus::Blocked {
                        failed: pred.describe(),
                    }
                }
                Err(e) => return OpStatus::errored(e),
            }
        }
        if !op.is_resumable() {
            return OpStatus::Eligible {
                mode: DispatchMode::Fresh,
            };
        }
        match &snap.progress {
            Err(e) => OpStatus::errored(e),
            Ok(Progress::AtStep { step, artifact }) => OpStatus::Eligible {
                mode: DispatchMode::Resume {
                    checkpoint: artifact.clone(),
                    step: *step,
                },
            },
            Ok(Progress::NotStarted) => {
                if let Some(check) = self.inputs {
                    if let Err(e) = check.check(&snap.job) {
                        return OpStatus::errored(&e);
                    }
                }
                OpStatus::Eligible {
                    mode: DispatchMode::Fresh,
                }
            }
        }
    }

    /// Classifies every operation in `ops` for one job.
    pub fn job_status(&self, snap: &JobSnapshot, ops: &[&Operation]) -> JobStatus {
        let problem = match (&snap.document, &snap.progress) {
            (Err(e), _) | (_, Err(e)) => Some(ProblemReport {
                class: e.class().to_string(),
                message: e.to_string(),
            }),
            _ => None,
        };
        JobStatus {
            id: snap.job.id.clone(),
            current_step: snap.progress.as_ref().ok().map(|p| p.current_step()),
            target: snap.target().ok().flatten(),
            problem,
            operations: ops
                .iter()
                .map(|op| OperationStatus {
                    operation: op.name.clone(),
                    status: self.status(op, snap),
                })
                .collect(),
        }
    }

    pub fn pass(&self, snaps: &[JobSnapshot], ops: &[&Operation]) -> Vec<JobStatus> {
        snaps.iter().map(|s| self.job_status(s, ops)).collect()
    }
}

/// JSON equality with numbers compared by value, so `1` matches `1.0`.
fn values_match(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_match(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map(|y| values_match(x, y)).unwrap_or(false))
        }
        _ => a == b,
    }
}

fn truthy(v: &serde_json::Value) -> bool {
    use serde_json::Value;
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{OperationKind, OperationSpec};
    use crate::config::InputsSection;
    use crate::environment::OperationDirectives;
    use crate::expand::{ParameterSpace, StatePoint};
    use crate::registry::Registry;
    use serde_json::json;
    use std::fs;

    const ARTIFACT: &str = "trajectory.jsonl";

    fn catalog() -> Catalog {
        let space = ParameterSpace::new()
            .with("input", vec![json!(["PCBM-gaff"])])
            .with("kT", vec![json!(1.0)]);
        let specs = vec![
            OperationSpec {
                name: "sample".to_string(),
                kind: OperationKind::Sample,
                command: vec!["sim".to_string()],
                pre: vec![],
                post: vec![],
                directives: OperationDirectives::default(),
            },
            OperationSpec {
                name: "rdf".to_string(),
                kind: OperationKind::Generic,
                command: vec!["rdf".to_string()],
                pre: vec![Predicate::Satisfied("sample".to_string())],
                post: vec![Predicate::File("rdf.txt".to_string())],
                directives: OperationDirectives::default(),
            },
        ];
        Catalog::build(&specs, &space).expect("catalog")
    }

    fn registry(tag: &str) -> Registry {
        let root = std::env::temp_dir().join(format!(
            "sweep_elig_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("root");
        Registry::new(&root)
    }

    fn job(reg: &Registry, input: &str, target: u64) -> JobRecord {
        let sp = StatePoint::from_pairs([("input", json!([input])), ("kT", json!(1.0))]);
        let job = reg.ensure(&sp).expect("ensure");
        reg.set_target(&job, target).expect("target");
        job
    }

    fn status_of(catalog: &Catalog, inputs: Option<&InputCheck>, job: &JobRecord, op: &str) -> OpStatus {
        let engine = Engine::new(catalog, inputs);
        let snap = JobSnapshot::take(job.clone(), ARTIFACT);
        engine.status(catalog.get(op).expect("op"), &snap)
    }

    #[test]
    fn not_started_job_is_eligible_fresh() {
        let reg = registry("fresh");
        let cat = catalog();
        let j = job(&reg, "PCBM-gaff", 100);
        assert_eq!(
            status_of(&cat, None, &j, "sample"),
            OpStatus::Eligible { mode: DispatchMode::Fresh }
        );
        assert!(matches!(status_of(&cat, None, &j, "rdf"), OpStatus::Blocked { .. }));
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn partial_progress_resumes_from_checkpoint() {
        let reg = registry("resume");
        let cat = catalog();
        let j = job(&reg, "PCBM-gaff", 100);
        fs::write(j.path(ARTIFACT), "{\"step\": 20}\n{\"step\": 40}\n").expect("write");
        assert_eq!(
            status_of(&cat, None, &j, "sample"),
            OpStatus::Eligible {
                mode: DispatchMode::Resume { checkpoint: j.path(ARTIFACT), step: 40 }
            }
        );
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn reaching_target_satisfies_and_unblocks_dependents() {
        let reg = registry("satisfied");
        let cat = catalog();
        let j = job(&reg, "PCBM-gaff", 100);
        fs::write(j.path(ARTIFACT), "{\"step\": 100}\n").expect("write");
        assert_eq!(status_of(&cat, None, &j, "sample"), OpStatus::Satisfied);
        assert!(status_of(&cat, None, &j, "rdf").is_eligible());
        fs::write(j.path("rdf.txt"), "r g(r)\n").expect("write");
        assert_eq!(status_of(&cat, None, &j, "rdf"), OpStatus::Satisfied);
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn corrupt_artifact_is_reported_distinctly() {
        let reg = registry("corrupt");
        let cat = catalog();
        let j = job(&reg, "PCBM-gaff", 100);
        fs::write(j.path(ARTIFACT), "{\"step\": 4").expect("write");
        match status_of(&cat, None, &j, "sample") {
            OpStatus::Errored { class, .. } => assert_eq!(class, "corrupt_artifact"),
            other => panic!("expected errored, got {:?}", other),
        }
        let engine = Engine::new(&cat, None);
        let ops: Vec<&Operation> = cat.iter().collect();
        let status = engine.job_status(&JobSnapshot::take(j.clone(), ARTIFACT), &ops);
        assert_eq!(status.current_step, None);
        assert_eq!(status.problem.map(|p| p.class).as_deref(), Some("corrupt_artifact"));
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn missing_input_blocks_only_fresh_starts() {
        let reg = registry("inputs");
        let cat = catalog();
        let check = InputCheck::new(
            &InputsSection {
                param: "input".to_string(),
                compounds: vec!["PCBM-gaff".to_string()],
            },
            reg.root(),
        );
        let good = job(&reg, "PCBM-gaff", 100);
        let bad = job(&reg, "nope-gaff", 100);
        assert!(status_of(&cat, Some(&check), &good, "sample").is_eligible());
        match status_of(&cat, Some(&check), &bad, "sample") {
            OpStatus::Errored { class, .. } => assert_eq!(class, "missing_input"),
            other => panic!("expected errored, got {:?}", other),
        }
        // Once a checkpoint exists the structure is no longer rebuilt.
        fs::write(bad.path(ARTIFACT), "{\"step\": 10}\n").expect("write");
        assert!(status_of(&cat, Some(&check), &bad, "sample").is_eligible());
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn repeated_passes_agree() {
        let reg = registry("idempotent");
        let cat = catalog();
        let a = job(&reg, "PCBM-gaff", 100);
        job(&reg, "P3HT-16-gaff", 100);
        fs::write(a.path(ARTIFACT), "{\"step\": 50}\n").expect("write");
        let engine = Engine::new(&cat, None);
        let ops: Vec<&Operation> = cat.iter().collect();
        let take = || -> Vec<JobSnapshot> {
            reg.all()
                .expect("all")
                .into_iter()
                .map(|j| JobSnapshot::take(j, ARTIFACT))
                .collect()
        };
        let first = engine.pass(&take(), &ops);
        let second = engine.pass(&take(), &ops);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn doc_and_param_predicates() {
        let reg = registry("preds");
        let cat = catalog();
        let j = job(&reg, "PCBM-gaff", 100);
        let engine = Engine::new(&cat, None);
        let snap = JobSnapshot::take(j.clone(), ARTIFACT);
        assert!(!engine.holds(&Predicate::Doc("done".into()), &snap).expect("doc"));
        assert!(engine
            .holds(&Predicate::Param { name: "kT".into(), equals: json!(1.0) }, &snap)
            .expect("param"));
        assert!(engine
            .holds(&Predicate::Not(Box::new(Predicate::File("rdf.txt".into()))), &snap)
            .expect("not"));
        j.update_document(|d| d.done = Some(true)).expect("doc");
        let snap = JobSnapshot::take(j, ARTIFACT);
        assert!(engine.holds(&Predicate::Doc("done".into()), &snap).expect("doc"));
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn param_predicate_compares_numbers_by_value() {
        let reg = registry("param_numeric");
        let cat = catalog();
        let j = job(&reg, "PCBM-gaff", 100);
        let engine = Engine::new(&cat, None);
        let snap = JobSnapshot::take(j, ARTIFACT);
        let param = |name: &str, equals| Predicate::Param { name: name.into(), equals };
        // kT is stored as 1.0; a YAML `equals: 1` parses as an integer.
        assert!(engine.holds(&param("kT", json!(1)), &snap).expect("int vs float"));
        assert!(!engine.holds(&param("kT", json!(2)), &snap).expect("different"));
        assert!(!engine.holds(&param("kT", json!("1")), &snap).expect("string"));
        assert!(engine
            .holds(&param("input", json!(["PCBM-gaff"])), &snap)
            .expect("array"));
        assert!(!engine.holds(&param("missing", json!(1)), &snap).expect("absent"));
        assert!(values_match(&json!({"a": [1, 2.5]}), &json!({"a": [1.0, 2.5]})));
        assert!(!values_match(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        let _ = fs::remove_dir_all(reg.root());
    }
}
