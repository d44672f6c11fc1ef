//! Project handle: one loaded `sweep.yaml` plus the registry under its root.
//!
//! Every orchestration call goes through an explicit `Project`; there is no
//! process-wide current project.

use crate::catalog::{Catalog, Operation};
use crate::config::{find_project_root, load_config, SweepConfig, CONFIG_FILE};
use crate::dispatch::{default_sweep_bin, BatchSubmitter, DispatchRequest, LocalExecutor, Outcome};
use crate::eligibility::{DispatchMode, Engine, JobSnapshot, JobStatus, OpStatus};
use crate::environment::{Directives, EnvironmentTable, HostEnvironment};
use crate::error::{ConfigError, JobError};
use crate::expand::{ParameterSpace, StatePoint};
use crate::inputs::InputCheck;
use crate::registry::{JobDocument, JobRecord, Registry};
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    config: SweepConfig,
    space: ParameterSpace,
    catalog: Catalog,
    environments: EnvironmentTable,
    inputs: Option<InputCheck>,
    registry: Registry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitSummary {
    pub total: usize,
    pub created: usize,
    pub existing: usize,
    /// Entries in the index after merging, including jobs from earlier sweeps.
    pub indexed: usize,
    /// Jobs that could not be initialized. The others are still set up.
    pub problems: Vec<InitProblem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitProblem {
    pub job: String,
    pub class: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub operations: Vec<String>,
    pub jobs: Vec<String>,
    pub pretend: bool,
    pub host: String,
}

pub type SubmitOptions = RunOptions;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchEntry {
    pub job: String,
    pub operation: String,
    pub mode: DispatchMode,
    pub environment: String,
    pub command: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProblem {
    pub job: String,
    pub operation: String,
    pub class: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub entries: Vec<DispatchEntry>,
    pub problems: Vec<JobProblem>,
}

impl DispatchReport {
    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.is_failure()).count()
    }

    /// Pairs that were eligible but not started, e.g. because another
    /// executor holds the job's operation lock.
    pub fn skipped(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Skipped { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub workspace: PathBuf,
    pub statepoint: StatePoint,
    pub document: Option<JobDocument>,
    pub status: JobStatus,
}

impl Project {
    /// Finds `sweep.yaml` at or above `start` and loads it.
    pub fn open(start: &Path) -> Result<Self> {
        let root = find_project_root(start).ok_or_else(|| {
            anyhow!(
                "no {} found in {} or any parent directory",
                CONFIG_FILE,
                start.display()
            )
        })?;
        let config = load_config(&root.join(CONFIG_FILE))?;
        Ok(Self::from_config(&root, config)?)
    }

    /// Validates the whole definition before any job is touched.
    pub fn from_config(root: &Path, config: SweepConfig) -> Result<Self, ConfigError> {
        let mut space = ParameterSpace::new();
        for (name, values) in &config.parameters {
            space.insert(name.clone(), values.clone());
        }
        if space.is_empty() {
            return Err(ConfigError::NoParameters);
        }
        if let Some(name) = space.first_empty() {
            return Err(ConfigError::EmptySweep(name.to_string()));
        }

        let target = &config.target.param;
        let candidates = space.values(target).ok_or_else(|| ConfigError::InvalidTarget {
            param: target.clone(),
            reason: "not a sweep parameter".to_string(),
        })?;
        for value in candidates {
            target_steps(value).map_err(|reason| ConfigError::InvalidTarget {
                param: target.clone(),
                reason,
            })?;
        }

        let inputs = match &config.inputs {
            Some(section) if !space.contains(&section.param) => {
                return Err(ConfigError::UnknownParameter {
                    param: section.param.clone(),
                    referrer: "inputs".to_string(),
                })
            }
            Some(section) => Some(InputCheck::new(section, root)),
            None => None,
        };

        let catalog = Catalog::build(&config.operations, &space)?;
        let environments = EnvironmentTable::build(
            &config.environments,
            config.default_environment.clone(),
            config.builtin_environments,
        )?;
        debug!(
            root = %root.display(),
            parameters = space.len(),
            operations = catalog.len(),
            "loaded project"
        );
        Ok(Self {
            root: root.to_path_buf(),
            registry: Registry::new(root),
            config,
            space,
            catalog,
            environments,
            inputs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn environment_for(&self, host: &str) -> &HostEnvironment {
        self.environments.resolve(host)
    }

    fn engine(&self) -> Engine<'_> {
        Engine::new(&self.catalog, self.inputs.as_ref())
    }

    fn artifact(&self) -> &str {
        &self.config.progress.artifact
    }

    /// Target step count of a state point.
    pub fn target_for(&self, statepoint: &StatePoint) -> Result<u64, ConfigError> {
        let param = &self.config.target.param;
        let invalid = |reason: String| ConfigError::InvalidTarget {
            param: param.clone(),
            reason,
        };
        let value = statepoint
            .get(param)
            .ok_or_else(|| invalid("missing from state point".to_string()))?;
        target_steps(value).map_err(invalid)
    }

    /// Creates (or finds) one job per state point, records its target and
    /// refreshes the index.
    pub fn init(&self) -> Result<InitSummary> {
        let points = self.space.expand();
        let mut summary = InitSummary {
            total: points.len(),
            created: 0,
            existing: 0,
            indexed: 0,
            problems: Vec::new(),
        };
        for sp in &points {
            let steps = self.target_for(sp)?;
            let tracked = self
                .registry
                .ensure_tracked(sp)
                .and_then(|(job, created)| self.registry.set_target(&job, steps).map(|_| created));
            match tracked {
                Ok(true) => summary.created += 1,
                Ok(false) => summary.existing += 1,
                Err(e) => {
                    let class = e
                        .downcast_ref::<JobError>()
                        .map(JobError::class)
                        .unwrap_or("io")
                        .to_string();
                    let job = sp.id();
                    warn!(job = %job, %class, "could not initialize job: {:#}", e);
                    summary.problems.push(InitProblem {
                        job,
                        class,
                        message: format!("{:#}", e),
                    });
                }
            }
        }
        summary.indexed = self.registry.write_index()?;
        info!(
            total = summary.total,
            created = summary.created,
            existing = summary.existing,
            problems = summary.problems.len(),
            "Initialized {} jobs",
            summary.total - summary.problems.len()
        );
        Ok(summary)
    }

    /// Every job matching one of the id prefixes (all jobs when empty).
    pub fn jobs(&self, prefixes: &[String]) -> Result<Vec<JobRecord>> {
        let all = self.registry.all()?;
        if prefixes.is_empty() {
            return Ok(all);
        }
        for prefix in prefixes {
            if !all.iter().any(|j| j.id.starts_with(prefix.as_str())) {
                return Err(anyhow!("no job matches '{}'", prefix));
            }
        }
        Ok(all
            .into_iter()
            .filter(|j| prefixes.iter().any(|p| j.id.starts_with(p.as_str())))
            .collect())
    }

    pub fn snapshot(&self, job: JobRecord) -> JobSnapshot {
        JobSnapshot::take(job, self.artifact())
    }

    fn snapshots(&self, prefixes: &[String]) -> Result<Vec<JobSnapshot>> {
        Ok(self
            .jobs(prefixes)?
            .into_iter()
            .map(|j| self.snapshot(j))
            .collect())
    }

    /// One eligibility pass, read-only.
    pub fn status(&self, operations: &[String], jobs: &[String]) -> Result<Vec<JobStatus>> {
        let ops = self.catalog.select(operations)?;
        let snaps = self.snapshots(jobs)?;
        Ok(self.engine().pass(&snaps, &ops))
    }

    pub fn show(&self, id_or_prefix: &str) -> Result<JobView> {
        let job = self.registry.open(id_or_prefix)?;
        let snap = self.snapshot(job.clone());
        let ops: Vec<&Operation> = self.catalog.iter().collect();
        let status = self.engine().job_status(&snap, &ops);
        Ok(JobView {
            id: job.id.clone(),
            workspace: job.workspace.clone(),
            statepoint: job.statepoint.clone(),
            document: snap.document.ok(),
            status,
        })
    }

    /// Sets document keys on one job, e.g. from an operation annotating its
    /// own results.
    pub fn annotate(&self, id_or_prefix: &str, bindings: &[(String, Value)]) -> Result<JobDocument> {
        let job = self.registry.open(id_or_prefix)?;
        let mut staged = job.document()?;
        for (key, value) in bindings {
            staged.set(key, value.clone())?;
        }
        job.update_document(|doc| *doc = staged)
    }

    fn request(&self, op: &Operation, snap: &JobSnapshot, mode: DispatchMode, host: &str) -> DispatchRequest {
        let directives = Directives::resolve(self.environments.resolve(host), &op.directives);
        DispatchRequest::new(op, snap, mode, directives)
    }

    /// Runs eligible pairs locally, one at a time, re-evaluating after every
    /// pass so dependents of a finished operation are picked up in the same
    /// invocation. Each pair is attempted at most once.
    pub fn run(&self, opts: &RunOptions) -> Result<DispatchReport> {
        let ops = self.catalog.select(&opts.operations)?;
        let executor = LocalExecutor::new(self.artifact());
        self.dispatch_passes(opts, &ops, !opts.pretend, |job, op, req| {
            if opts.pretend {
                Outcome::Pretend {
                    command: req.command_line(),
                }
            } else {
                executor.run(job, req, op.is_resumable())
            }
        })
    }

    /// Hands every eligible pair to the batch scheduler. A single pass:
    /// dependents only become eligible once the scheduler has run their
    /// prerequisites, which a later `submit` observes.
    pub fn submit(&self, opts: &SubmitOptions) -> Result<DispatchReport> {
        let ops = self.catalog.select(&opts.operations)?;
        let submitter = BatchSubmitter {
            command: self.config.submit.command.clone(),
            sweep_bin: self
                .config
                .submit
                .sweep_bin
                .clone()
                .unwrap_or_else(default_sweep_bin),
            project_root: self.root.clone(),
            host: opts.host.clone(),
        };
        self.dispatch_passes(opts, &ops, false, |_, _, req| {
            if opts.pretend {
                Outcome::Pretend {
                    command: crate::dispatch::shell_join(&submitter.submission_argv(req)),
                }
            } else {
                submitter.submit(req)
            }
        })
    }

    fn dispatch_passes<F>(
        &self,
        opts: &RunOptions,
        ops: &[&Operation],
        repeat: bool,
        mut dispatch: F,
    ) -> Result<DispatchReport>
    where
        F: FnMut(&JobRecord, &Operation, &DispatchRequest) -> Outcome,
    {
        let engine = self.engine();
        let env = self.environments.resolve(&opts.host);
        info!(host = %opts.host, environment = %env.name, "dispatching");
        let mut attempted: BTreeSet<(String, String)> = BTreeSet::new();
        let mut report = DispatchReport::default();
        loop {
            let mut dispatched = 0;
            for snap in self.snapshots(&opts.jobs)? {
                for &op in ops {
                    let key = (snap.job.id.clone(), op.name.clone());
                    if attempted.contains(&key) {
                        continue;
                    }
                    match engine.status(op, &snap) {
                        OpStatus::Eligible { mode } => {
                            attempted.insert(key);
                            let req = self.request(op, &snap, mode.clone(), &opts.host);
                            let outcome = dispatch(&snap.job, op, &req);
                            dispatched += 1;
                            report.entries.push(DispatchEntry {
                                job: snap.job.id.clone(),
                                operation: op.name.clone(),
                                mode,
                                environment: req.directives.environment.clone(),
                                command: req.command_line(),
                                outcome,
                            });
                        }
                        OpStatus::Errored { class, message } => {
                            attempted.insert(key);
                            warn!(job = %snap.job.id, operation = %op.name, %class, "{}", message);
                            report.problems.push(JobProblem {
                                job: snap.job.id.clone(),
                                operation: op.name.clone(),
                                class,
                                message,
                            });
                        }
                        OpStatus::Blocked { .. } | OpStatus::Satisfied => {}
                    }
                }
            }
            if dispatched == 0 || !repeat {
                break;
            }
        }
        info!(
            dispatched = report.entries.len(),
            failed = report.failed(),
            skipped = report.skipped(),
            problems = report.problems.len(),
            "dispatch finished"
        );
        Ok(report)
    }

    /// Runs exactly one pair locally after re-checking it. Used by batch
    /// jobs submitted from `submit`.
    pub fn exec(&self, operation: &str, id_or_prefix: &str, host: &str) -> Result<DispatchEntry> {
        let op = self
            .catalog
            .get(operation)
            .ok_or_else(|| ConfigError::UnknownOperation {
                op: operation.to_string(),
                referrer: "exec".to_string(),
            })?;
        let job = self.registry.open(id_or_prefix)?;
        let snap = self.snapshot(job);
        let status = self.engine().status(op, &snap);
        let mode = match status {
            OpStatus::Eligible { mode } => mode,
            OpStatus::Errored { class, message } => {
                return Err(anyhow!(
                    "{} on {} is not runnable ({}): {}",
                    op.name,
                    snap.job.id,
                    class,
                    message
                ))
            }
            other => {
                let reason = match other {
                    OpStatus::Blocked { failed } => format!("blocked: {}", failed),
                    _ => "already satisfied".to_string(),
                };
                info!(job = %snap.job.id, operation = %op.name, %reason, "nothing to do");
                return Ok(DispatchEntry {
                    job: snap.job.id.clone(),
                    operation: op.name.clone(),
                    mode: DispatchMode::Fresh,
                    environment: self.environments.resolve(host).name.clone(),
                    command: String::new(),
                    outcome: Outcome::Skipped { reason },
                });
            }
        };
        let req = self.request(op, &snap, mode.clone(), host);
        let outcome = LocalExecutor::new(self.artifact()).run(&snap.job, &req, op.is_resumable());
        Ok(DispatchEntry {
            job: snap.job.id.clone(),
            operation: op.name.clone(),
            mode,
            environment: req.directives.environment.clone(),
            command: req.command_line(),
            outcome,
        })
    }
}

/// Target step count from a parameter value: a number, or a possibly nested
/// list of per-stage counts that are summed. Rounded to the nearest step.
pub fn target_steps(value: &Value) -> Result<u64, String> {
    let total = sum_steps(value)?;
    if !total.is_finite() || total < 0.0 {
        return Err(format!("{} is not a non-negative step count", value));
    }
    Ok(total.round() as u64)
}

fn sum_steps(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{} is not representable as a step count", n)),
        Value::Array(items) => items.iter().map(sum_steps).sum(),
        other => Err(format!("{} is not a number or a list of numbers", other)),
    }
}
