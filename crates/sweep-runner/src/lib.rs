//! Parameter-sweep orchestration: expands a parameter space into jobs, keeps
//! a persistent registry of them, and dispatches whichever operations are
//! eligible for each job on the current pass.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod eligibility;
pub mod environment;
pub mod error;
pub mod expand;
pub mod inputs;
pub mod progress;
pub mod project;
pub mod registry;

pub use catalog::{Catalog, Operation, OperationKind, OperationSpec, Predicate};
pub use config::{find_project_root, load_config, parse_config, SweepConfig, CONFIG_FILE, CONFIG_TEMPLATE};
pub use dispatch::{BatchSubmitter, DispatchRequest, LocalExecutor, Outcome};
pub use eligibility::{DispatchMode, Engine, JobSnapshot, JobStatus, OpStatus};
pub use environment::{detect_host, Directives, EnvironmentTable, HostEnvironment};
pub use error::{ConfigError, JobError};
pub use expand::{ParameterSpace, StatePoint};
pub use progress::{current_step, read_progress, Progress, NOT_STARTED};
pub use project::{
    DispatchEntry, DispatchReport, InitProblem, InitSummary, JobProblem, JobView, Project, RunOptions,
    SubmitOptions,
};
pub use registry::{JobDocument, JobRecord, Registry, RunStats};
