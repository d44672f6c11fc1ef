use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use sweep_runner::{
    detect_host, ConfigError, DispatchReport, JobStatus, OpStatus, Outcome, Project, RunOptions,
    CONFIG_FILE, CONFIG_TEMPLATE,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Parameter-sweep job orchestrator")]
struct Cli {
    /// Project directory (defaults to the nearest one containing sweep.yaml)
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    /// Host name used to pick the execution environment
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter sweep.yaml
    New {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Create a job for every state point of the sweep
    Init {
        #[arg(long)]
        json: bool,
    },
    /// Show per-operation status of every job
    Status {
        #[arg(long = "op")]
        operations: Vec<String>,
        #[arg(long = "job")]
        jobs: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run eligible operations locally
    Run {
        #[arg(long = "op")]
        operations: Vec<String>,
        #[arg(long = "job")]
        jobs: Vec<String>,
        #[arg(long)]
        pretend: bool,
        #[arg(long)]
        json: bool,
    },
    /// Submit eligible operations to the batch scheduler
    Submit {
        #[arg(long = "op")]
        operations: Vec<String>,
        #[arg(long = "job")]
        jobs: Vec<String>,
        #[arg(long)]
        pretend: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run one operation on one job
    Exec {
        operation: String,
        job: String,
        #[arg(long)]
        json: bool,
    },
    /// Show one job's state point, document and status
    Show {
        job: String,
        #[arg(long)]
        json: bool,
    },
    /// Read or annotate a job document
    Document {
        job: String,
        #[arg(long = "set")]
        set: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show the environment resolved for this host
    Env {
        #[arg(long)]
        json: bool,
    },
}

struct Reply {
    payload: Option<Value>,
    success: bool,
}

impl Reply {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            success: true,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli) {
        Ok(reply) => {
            if let Some(payload) = reply.payload {
                emit_json(&payload);
            }
            if !reply.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                let code = if err.downcast_ref::<ConfigError>().is_some() {
                    "config_error"
                } else {
                    "command_failed"
                };
                let details = json!({ "causes": err.chain().skip(1).map(|c| c.to_string()).collect::<Vec<_>>() });
                emit_json(&json_error(code, err.to_string(), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn project_dir(cli_project: &Option<PathBuf>) -> Result<PathBuf> {
    match cli_project {
        Some(p) => Ok(p.clone()),
        None => Ok(std::env::current_dir()?),
    }
}

fn run_command(cli: Cli) -> Result<Reply> {
    let host = detect_host(cli.host.as_deref());
    debug!(%host, "resolved host");
    if let Commands::New { force, json } = &cli.command {
        let dir = project_dir(&cli.project)?;
        let path = dir.join(CONFIG_FILE);
        if path.exists() && !force {
            return Err(anyhow!("{} already exists (use --force to overwrite)", path.display()));
        }
        sweep_core::ensure_dir(&dir)?;
        sweep_core::atomic_write_bytes(&path, CONFIG_TEMPLATE.as_bytes())?;
        if *json {
            return Ok(Reply::done(Some(json!({
                "ok": true,
                "command": "new",
                "config": path.display().to_string()
            }))));
        }
        println!("wrote {}", path.display());
        return Ok(Reply::done(None));
    }

    let project = Project::open(&project_dir(&cli.project)?)?;
    match cli.command {
        Commands::New { .. } => Ok(Reply::done(None)),
        Commands::Init { json } => {
            let summary = project.init()?;
            let success = summary.problems.is_empty();
            if json {
                return Ok(Reply {
                    payload: Some(json!({
                        "ok": success,
                        "command": "init",
                        "root": project.root().display().to_string(),
                        "summary": summary
                    })),
                    success,
                });
            }
            for problem in &summary.problems {
                println!(
                    "{:<8} error   [{}] {}",
                    &problem.job[..problem.job.len().min(8)],
                    problem.class,
                    problem.message
                );
            }
            println!(
                "jobs: {} ({} created, {} existing, {} errors); index: {} entries",
                summary.total,
                summary.created,
                summary.existing,
                summary.problems.len(),
                summary.indexed
            );
            Ok(Reply {
                payload: None,
                success,
            })
        }
        Commands::Status {
            operations,
            jobs,
            json,
        } => {
            let statuses = project.status(&operations, &jobs)?;
            if json {
                return Ok(Reply::done(Some(json!({
                    "ok": true,
                    "command": "status",
                    "jobs": statuses
                }))));
            }
            print_status(&statuses);
            Ok(Reply::done(None))
        }
        Commands::Run {
            operations,
            jobs,
            pretend,
            json,
        } => {
            let opts = RunOptions {
                operations,
                jobs,
                pretend,
                host,
            };
            let report = project.run(&opts)?;
            Ok(dispatch_reply("run", &opts, &report, json))
        }
        Commands::Submit {
            operations,
            jobs,
            pretend,
            json,
        } => {
            let opts = RunOptions {
                operations,
                jobs,
                pretend,
                host,
            };
            let report = project.submit(&opts)?;
            Ok(dispatch_reply("submit", &opts, &report, json))
        }
        Commands::Exec {
            operation,
            job,
            json,
        } => {
            let entry = project.exec(&operation, &job, &host)?;
            let success = !entry.outcome.is_failure();
            if json {
                return Ok(Reply {
                    payload: Some(json!({
                        "ok": success,
                        "command": "exec",
                        "host": host,
                        "entry": entry
                    })),
                    success,
                });
            }
            println!(
                "{} {} [{}] {}",
                entry.operation,
                entry.job,
                entry.mode.label(),
                outcome_text(&entry.outcome)
            );
            Ok(Reply {
                payload: None,
                success,
            })
        }
        Commands::Show { job, json } => {
            let view = project.show(&job)?;
            if json {
                return Ok(Reply::done(Some(json!({
                    "ok": true,
                    "command": "show",
                    "job": view
                }))));
            }
            println!("id: {}", view.id);
            println!("workspace: {}", view.workspace.display());
            println!("statepoint: {}", serde_json::to_string(&view.statepoint)?);
            match &view.document {
                Some(doc) => println!("document: {}", serde_json::to_string(doc)?),
                None => println!("document: <unreadable>"),
            }
            print_status(std::slice::from_ref(&view.status));
            Ok(Reply::done(None))
        }
        Commands::Document { job, set, json } => {
            let bindings = parse_set_bindings(&set)?;
            let doc = if bindings.is_empty() {
                project.registry().open(&job)?.document()?
            } else {
                project.annotate(&job, &bindings)?
            };
            if json {
                return Ok(Reply::done(Some(json!({
                    "ok": true,
                    "command": "document",
                    "document": doc
                }))));
            }
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(Reply::done(None))
        }
        Commands::Env { json } => {
            let env = project.environment_for(&host);
            if json {
                return Ok(Reply::done(Some(json!({
                    "ok": true,
                    "command": "env",
                    "host": host,
                    "environment": env
                }))));
            }
            println!("host: {}", host);
            println!("environment: {}", env.name);
            println!("partition: {}", env.partition.as_deref().unwrap_or("-"));
            match env.max_gpus {
                Some(n) => println!("max_gpus: {}", n),
                None => println!("max_gpus: unlimited"),
            }
            if !env.wrapper.is_empty() {
                println!("wrapper: {}", env.wrapper.join(" "));
            }
            if !env.extra_flags.is_empty() {
                println!("extra_flags: {}", env.extra_flags.join(" "));
            }
            Ok(Reply::done(None))
        }
    }
}

fn dispatch_reply(command: &str, opts: &RunOptions, report: &DispatchReport, json: bool) -> Reply {
    let success = report.failed() == 0;
    if json {
        return Reply {
            payload: Some(json!({
                "ok": success,
                "command": command,
                "host": opts.host,
                "pretend": opts.pretend,
                "dispatched": report.entries.len(),
                "failed": report.failed(),
                "skipped": report.skipped(),
                "entries": report.entries,
                "problems": report.problems
            })),
            success,
        };
    }
    for entry in &report.entries {
        println!(
            "{:<8} {:<12} {:<7} {}",
            &entry.job[..entry.job.len().min(8)],
            entry.operation,
            entry.mode.label(),
            outcome_text(&entry.outcome)
        );
    }
    for problem in &report.problems {
        println!(
            "{:<8} {:<12} error   [{}] {}",
            &problem.job[..problem.job.len().min(8)],
            problem.operation,
            problem.class,
            problem.message
        );
    }
    println!("{}", summary_line(command, report));
    Reply {
        payload: None,
        success,
    }
}

fn summary_line(command: &str, report: &DispatchReport) -> String {
    format!(
        "{}: {} dispatched, {} failed, {} skipped, {} job errors",
        command,
        report.entries.len(),
        report.failed(),
        report.skipped(),
        report.problems.len()
    )
}

fn outcome_text(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Succeeded => "ok".to_string(),
        Outcome::Failed { reason } => format!("FAILED: {}", reason),
        Outcome::Skipped { reason } => format!("skipped: {}", reason),
        Outcome::Submitted { scheduler_output } => format!("submitted: {}", scheduler_output),
        Outcome::Pretend { command } => command.clone(),
    }
}

fn print_status(statuses: &[JobStatus]) {
    for status in statuses {
        let step = match status.current_step {
            Some(step) => step.to_string(),
            None => "?".to_string(),
        };
        let target = status
            .target
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        let ops: Vec<String> = status
            .operations
            .iter()
            .map(|o| match &o.status {
                OpStatus::Eligible { mode } => format!("{}: eligible ({})", o.operation, mode.label()),
                OpStatus::Errored { class, .. } => format!("{}: errored [{}]", o.operation, class),
                other => format!("{}: {}", o.operation, other.label()),
            })
            .collect();
        println!(
            "{:<8}  {:>10}/{:<10}  {}",
            &status.id[..status.id.len().min(8)],
            step,
            target,
            ops.join("  ")
        );
        if let Some(problem) = &status.problem {
            println!("          {} ({})", problem.message, problem.class);
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::New { json, .. }
        | Commands::Init { json }
        | Commands::Status { json, .. }
        | Commands::Run { json, .. }
        | Commands::Submit { json, .. }
        | Commands::Exec { json, .. }
        | Commands::Show { json, .. }
        | Commands::Document { json, .. }
        | Commands::Env { json } => *json,
    }
}

fn parse_set_bindings(values: &[String]) -> Result<Vec<(String, Value)>> {
    let mut out = Vec::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.push((key.trim().to_string(), parsed));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweep_runner::{DispatchEntry, DispatchMode};

    #[test]
    fn set_bindings_parse_json_with_string_fallback() {
        let parsed = parse_set_bindings(&[
            "done=true".to_string(),
            "note=cooled too fast".to_string(),
            "units={\"kT\": 1.5}".to_string(),
        ])
        .expect("parse");
        assert_eq!(parsed[0], ("done".to_string(), json!(true)));
        assert_eq!(parsed[1], ("note".to_string(), json!("cooled too fast")));
        assert_eq!(parsed[2].1, json!({"kT": 1.5}));
        assert!(parse_set_bindings(&["novalue".to_string()]).is_err());
        assert!(parse_set_bindings(&["=1".to_string()]).is_err());
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from(["sweep", "exec", "sample", "abc123", "--host", "fry", "--project", "/data/p"])
            .expect("parse");
        assert_eq!(cli.host.as_deref(), Some("fry"));
        assert_eq!(cli.project, Some(PathBuf::from("/data/p")));
        assert!(matches!(cli.command, Commands::Exec { .. }));
    }

    #[test]
    fn summary_line_counts_skipped_pairs() {
        let entry = |outcome| DispatchEntry {
            job: "0123456789abcdef".to_string(),
            operation: "sample".to_string(),
            mode: DispatchMode::Fresh,
            environment: "local".to_string(),
            command: "sim".to_string(),
            outcome,
        };
        let report = DispatchReport {
            entries: vec![
                entry(Outcome::Succeeded),
                entry(Outcome::Skipped {
                    reason: "lock held".to_string(),
                }),
                entry(Outcome::Failed {
                    reason: "exit 1".to_string(),
                }),
            ],
            problems: vec![],
        };
        assert_eq!(
            summary_line("run", &report),
            "run: 3 dispatched, 1 failed, 1 skipped, 0 job errors"
        );
    }

    #[test]
    fn every_subcommand_has_help_text() {
        use clap::CommandFactory;
        let cmd = Cli::command();
        for sub in cmd.get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no help text", sub.get_name());
        }
    }

    #[test]
    fn json_errors_have_stable_shape() {
        let v = json_error("config_error", "empty sweep".to_string(), json!({}));
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["code"], json!("config_error"));
    }
}
