//! Dispatching eligible (job, operation) pairs to external executors.
//!
//! The operation itself is an external command. It learns about its job
//! through `SWEEP_*` environment variables and runs with the job workspace as
//! its working directory.

use crate::catalog::Operation;
use crate::eligibility::{DispatchMode, JobSnapshot};
use crate::environment::Directives;
use crate::progress::read_progress;
use crate::registry::{JobRecord, RunStats};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;
use sweep_core::LockFile;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRequest {
    pub job_id: String,
    pub operation: String,
    pub mode: DispatchMode,
    pub workspace: PathBuf,
    pub statepoint_path: PathBuf,
    pub current_step: i64,
    pub target_steps: Option<u64>,
    pub directives: Directives,
    /// Final argv: host wrapper followed by the operation command.
    pub command: Vec<String>,
}

impl DispatchRequest {
    pub fn new(op: &Operation, snap: &JobSnapshot, mode: DispatchMode, directives: Directives) -> Self {
        let command = directives.wrap(&op.command);
        Self {
            job_id: snap.job.id.clone(),
            operation: op.name.clone(),
            current_step: snap
                .progress
                .as_ref()
                .map(|p| p.current_step())
                .unwrap_or(crate::progress::NOT_STARTED),
            target_steps: snap.target().ok().flatten(),
            mode,
            workspace: snap.job.workspace.clone(),
            statepoint_path: snap.job.statepoint_path(),
            directives,
            command,
        }
    }

    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("SWEEP_JOB_ID", self.job_id.clone()),
            ("SWEEP_OPERATION", self.operation.clone()),
            ("SWEEP_WORKSPACE", self.workspace.display().to_string()),
            ("SWEEP_STATEPOINT", self.statepoint_path.display().to_string()),
            ("SWEEP_MODE", self.mode.label().to_string()),
            ("SWEEP_CURRENT_STEP", self.current_step.to_string()),
            ("SWEEP_GPUS", self.directives.gpus.to_string()),
        ];
        if let Some(target) = self.target_steps {
            vars.push(("SWEEP_TARGET_STEPS", target.to_string()));
        }
        if let DispatchMode::Resume { checkpoint, .. } = &self.mode {
            vars.push(("SWEEP_RESTART", checkpoint.display().to_string()));
        }
        vars
    }

    pub fn command_line(&self) -> String {
        shell_join(&self.command)
    }

    fn lock_path(&self) -> PathBuf {
        self.workspace.join(format!(".lock.{}", self.operation))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { reason: String },
    Skipped { reason: String },
    Submitted { scheduler_output: String },
    Pretend { command: String },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// Runs operations as child processes on this machine, one at a time.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    artifact: String,
}

impl LocalExecutor {
    pub fn new(artifact: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
        }
    }

    /// Never returns an error: anything that goes wrong is this job's
    /// failure and is reported as such.
    pub fn run(&self, job: &JobRecord, req: &DispatchRequest, resumable: bool) -> Outcome {
        match self.run_inner(job, req, resumable) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    fn run_inner(&self, job: &JobRecord, req: &DispatchRequest, resumable: bool) -> Result<Outcome> {
        let Some(_lock) = LockFile::try_acquire(&req.lock_path())? else {
            warn!(job = %req.job_id, operation = %req.operation, "operation already running; skipping");
            return Ok(Outcome::Skipped {
                reason: format!("lock held: {}", req.lock_path().display()),
            });
        };
        let (program, args) = req
            .command
            .split_first()
            .ok_or_else(|| anyhow!("operation '{}' has an empty command", req.operation))?;

        let started_at = Utc::now().to_rfc3339();
        job.update_document(|doc| {
            let attempts = doc.runs.get(&req.operation).map(|r| r.attempts).unwrap_or(0);
            doc.runs.insert(
                req.operation.clone(),
                RunStats {
                    mode: req.mode.label().to_string(),
                    started_at: started_at.clone(),
                    attempts: attempts + 1,
                    ..RunStats::default()
                },
            );
        })?;

        info!(
            job = %req.job_id,
            operation = %req.operation,
            mode = req.mode.label(),
            gpus = req.directives.gpus,
            "running {}",
            req.command_line()
        );
        let clock = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&req.workspace)
            .envs(req.env_vars())
            .stdin(Stdio::null());
        let status = cmd.status();
        let wall = clock.elapsed().as_secs_f64();

        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        let outcome = match &status {
            Ok(s) if s.success() => Outcome::Succeeded,
            Ok(s) => Outcome::Failed {
                reason: match s.code() {
                    Some(code) => format!("exited with status {}", code),
                    None => "terminated by signal".to_string(),
                },
            },
            Err(e) => Outcome::Failed {
                reason: format!("failed to start '{}': {}", program, e),
            },
        };

        let reached_target = resumable
            && outcome == Outcome::Succeeded
            && match (read_progress(&job.path(&self.artifact)), req.target_steps) {
                (Ok(p), Some(target)) => p.reached(target),
                _ => false,
            };
        job.update_document(|doc| {
            if let Some(run) = doc.runs.get_mut(&req.operation) {
                run.finished_at = Some(Utc::now().to_rfc3339());
                run.wall_seconds = Some(wall);
                run.exit_code = exit_code;
            }
            if resumable {
                doc.done = Some(reached_target);
            }
        })?;

        match &outcome {
            Outcome::Failed { reason } => {
                warn!(job = %req.job_id, operation = %req.operation, %reason, "operation failed")
            }
            _ => info!(job = %req.job_id, operation = %req.operation, wall_seconds = wall, "operation finished"),
        }
        Ok(outcome)
    }
}

/// Hands operations to a batch scheduler and returns without waiting.
/// Submitted jobs call back into `sweep exec` on the compute node.
#[derive(Debug, Clone)]
pub struct BatchSubmitter {
    pub command: Vec<String>,
    pub sweep_bin: String,
    pub project_root: PathBuf,
    pub host: String,
}

impl BatchSubmitter {
    pub fn submission_argv(&self, req: &DispatchRequest) -> Vec<String> {
        let mut argv = self.command.clone();
        let short = &req.job_id[..req.job_id.len().min(8)];
        argv.push(format!("--job-name={}-{}", req.operation, short));
        if let Some(partition) = &req.directives.partition {
            argv.push(format!("--partition={}", partition));
        }
        if req.directives.gpus > 0 {
            argv.push(format!("--gres=gpu:{}", req.directives.gpus));
        }
        argv.extend(req.directives.extra_flags.iter().cloned());
        argv.push(format!("--chdir={}", req.workspace.display()));
        argv.push("--wrap".to_string());
        argv.push(shell_join(&[
            self.sweep_bin.clone(),
            "--project".to_string(),
            self.project_root.display().to_string(),
            "--host".to_string(),
            self.host.clone(),
            "exec".to_string(),
            req.operation.clone(),
            req.job_id.clone(),
        ]));
        argv
    }

    pub fn submit(&self, req: &DispatchRequest) -> Outcome {
        let argv = self.submission_argv(req);
        let Some((program, args)) = argv.split_first() else {
            return Outcome::Failed {
                reason: "submit command is empty".to_string(),
            };
        };
        info!(job = %req.job_id, operation = %req.operation, "submitting: {}", shell_join(&argv));
        match Command::new(program).args(args).stdin(Stdio::null()).output() {
            Ok(out) if out.status.success() => Outcome::Submitted {
                scheduler_output: String::from_utf8_lossy(&out.stdout).trim().to_string(),
            },
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let tail = stderr
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("submission command failed")
                    .to_string();
                Outcome::Failed { reason: tail }
            }
            Err(e) => Outcome::Failed {
                reason: format!("failed to start '{}': {}", program, e),
            },
        }
    }
}

/// Executable used by submitted jobs when none is configured.
pub fn default_sweep_bin() -> String {
    std::env::current_exe()
        .ok()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "sweep".to_string())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_word(p))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One argument as a POSIX shell word. Plain words pass through; anything
/// else is single-quoted with embedded quotes spelled `'\''`.
fn shell_word(arg: &str) -> Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b':' | b'=' | b'+' | b',' | b'@'));
    if plain {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{OperationKind, Predicate};
    use crate::environment::{HostEnvironment, OperationDirectives};
    use crate::expand::StatePoint;
    use crate::registry::Registry;
    use serde_json::json;
    use std::fs;

    fn setup(tag: &str) -> (Registry, JobRecord) {
        let root = std::env::temp_dir().join(format!(
            "sweep_dispatch_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("root");
        let reg = Registry::new(&root);
        let job = reg
            .ensure(&StatePoint::from_pairs([("kT", json!(1.0))]))
            .expect("ensure");
        reg.set_target(&job, 100).expect("target");
        (reg, job)
    }

    fn op(command: &[&str]) -> Operation {
        Operation {
            name: "sample".to_string(),
            kind: OperationKind::Sample,
            command: command.iter().map(|s| s.to_string()).collect(),
            pre: vec![],
            post: vec![Predicate::Sampled],
            directives: OperationDirectives { gpus: 1, extra_flags: vec![] },
        }
    }

    fn request(job: &JobRecord, op: &Operation, env: &HostEnvironment) -> DispatchRequest {
        let snap = JobSnapshot::take(job.clone(), "trajectory.jsonl");
        let mode = match snap.progress.as_ref().expect("progress") {
            crate::progress::Progress::NotStarted => DispatchMode::Fresh,
            crate::progress::Progress::AtStep { step, artifact } => DispatchMode::Resume {
                checkpoint: artifact.clone(),
                step: *step,
            },
        };
        DispatchRequest::new(op, &snap, mode, Directives::resolve(env, &op.directives))
    }

    #[test]
    fn resume_request_carries_restart_checkpoint() {
        let (reg, job) = setup("env");
        fs::write(job.path("trajectory.jsonl"), "{\"step\": 40}\n").expect("write");
        let req = request(&job, &op(&["python", "-u", "run_sim.py"]), &HostEnvironment::named("local"));
        let vars: std::collections::BTreeMap<&str, String> = req.env_vars().into_iter().collect();
        assert_eq!(vars["SWEEP_MODE"], "resume");
        assert_eq!(vars["SWEEP_CURRENT_STEP"], "40");
        assert_eq!(vars["SWEEP_TARGET_STEPS"], "100");
        assert_eq!(vars["SWEEP_RESTART"], job.path("trajectory.jsonl").display().to_string());
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn fresh_request_has_no_restart() {
        let (reg, job) = setup("fresh");
        let req = request(&job, &op(&["sim"]), &HostEnvironment::named("local"));
        let vars: std::collections::BTreeMap<&str, String> = req.env_vars().into_iter().collect();
        assert_eq!(vars["SWEEP_MODE"], "fresh");
        assert_eq!(vars["SWEEP_CURRENT_STEP"], "-1");
        assert!(!vars.contains_key("SWEEP_RESTART"));
        let _ = fs::remove_dir_all(reg.root());
    }

    #[cfg(unix)]
    #[test]
    fn local_run_records_stats_and_completion() {
        let (reg, job) = setup("local");
        let script = "echo '{\"step\": 100}' >> trajectory.jsonl";
        let sample = op(&["sh", "-c", script]);
        let req = request(&job, &sample, &HostEnvironment::named("local"));
        let outcome = LocalExecutor::new("trajectory.jsonl").run(&job, &req, true);
        assert_eq!(outcome, Outcome::Succeeded);
        let doc = job.document().expect("doc");
        assert_eq!(doc.done, Some(true));
        let run = doc.runs.get("sample").expect("run stats");
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.attempts, 1);
        assert_eq!(run.mode, "fresh");
        assert!(LockFile::try_acquire(&job.path(".lock.sample"))
            .expect("lock")
            .is_some());
        let _ = fs::remove_dir_all(reg.root());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_a_job_failure() {
        let (reg, job) = setup("fail");
        let req = request(&job, &op(&["sh", "-c", "exit 3"]), &HostEnvironment::named("local"));
        let exec = LocalExecutor::new("trajectory.jsonl");
        let outcome = exec.run(&job, &req, true);
        assert!(outcome.is_failure());
        let missing = request(&job, &op(&["definitely-not-a-real-binary-xyz"]), &HostEnvironment::named("local"));
        assert!(exec.run(&job, &missing, true).is_failure());
        let doc = job.document().expect("doc");
        assert_eq!(doc.runs["sample"].attempts, 2);
        assert_eq!(doc.done, Some(false));
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn held_lock_skips_the_job() {
        let (reg, job) = setup("lock");
        let req = request(&job, &op(&["true"]), &HostEnvironment::named("local"));
        let _held = LockFile::try_acquire(&job.path(".lock.sample"))
            .expect("lock")
            .expect("free");
        let outcome = LocalExecutor::new("trajectory.jsonl").run(&job, &req, true);
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert!(job.document().expect("doc").runs.is_empty());
        let _ = fs::remove_dir_all(reg.root());
    }

    #[cfg(unix)]
    #[test]
    fn lock_left_by_killed_executor_does_not_block() {
        let (reg, job) = setup("stale_lock");
        fs::write(
            job.path(".lock.sample"),
            "{\"pid\":999999,\"acquired_at\":\"2020-01-01T00:00:00Z\"}\n",
        )
        .expect("leftover lock");
        let script = "echo '{\"step\": 100}' >> trajectory.jsonl";
        let req = request(&job, &op(&["sh", "-c", script]), &HostEnvironment::named("local"));
        let outcome = LocalExecutor::new("trajectory.jsonl").run(&job, &req, true);
        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(job.document().expect("doc").done, Some(true));
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn submission_argv_carries_directives() {
        let (reg, job) = setup("submit");
        let env = HostEnvironment {
            partition: Some("GPU-shared".to_string()),
            extra_flags: vec!["--time=12:00:00".to_string()],
            wrapper: vec!["singularity".into(), "exec".into(), "--nv".into(), "sim.sif".into()],
            ..HostEnvironment::named("bridges")
        };
        let req = request(&job, &op(&["python", "-u", "run_sim.py"]), &env);
        assert_eq!(req.command[0], "singularity");
        let submitter = BatchSubmitter {
            command: vec!["sbatch".to_string()],
            sweep_bin: "/opt/bin/sweep".to_string(),
            project_root: PathBuf::from("/data/project"),
            host: "br005.bridges.psc.edu".to_string(),
        };
        let argv = submitter.submission_argv(&req);
        assert_eq!(argv[0], "sbatch");
        assert!(argv.contains(&"--partition=GPU-shared".to_string()));
        assert!(argv.contains(&"--gres=gpu:1".to_string()));
        assert!(argv.contains(&"--time=12:00:00".to_string()));
        let wrap = argv.last().expect("wrap");
        assert!(wrap.starts_with("/opt/bin/sweep --project /data/project --host br005.bridges.psc.edu exec sample "));
        assert!(wrap.ends_with(&job.id));
        let _ = fs::remove_dir_all(reg.root());
    }

    #[test]
    fn shell_words_are_quoted_only_when_needed() {
        assert_eq!(shell_word("run_sim.py"), "run_sim.py");
        assert_eq!(shell_word("--gres=gpu:1"), "--gres=gpu:1");
        assert_eq!(shell_word(""), "''");
        assert_eq!(shell_word("a b"), "'a b'");
        assert_eq!(shell_word("it's"), r"'it'\''s'");
        assert_eq!(
            shell_join(&["echo".to_string(), "$HOME".to_string()]),
            "echo '$HOME'"
        );
    }
}
