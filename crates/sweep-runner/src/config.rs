//! `sweep.yaml` loading.
//!
//! The file is read as YAML, converted to JSON (keeping mapping order) and
//! then deserialized into typed sections. Semantic validation lives with the
//! component that owns each section; see `Project::from_config`.

use crate::catalog::OperationSpec;
use crate::environment::HostEnvironment;
use crate::error::ConfigError;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "sweep.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub parameters: IndexMap<String, Vec<Value>>,
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub progress: ProgressSection,
    #[serde(default)]
    pub inputs: Option<InputsSection>,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
    #[serde(default)]
    pub environments: Vec<HostEnvironment>,
    #[serde(default = "default_environment")]
    pub default_environment: HostEnvironment,
    #[serde(default = "default_true")]
    pub builtin_environments: bool,
    #[serde(default)]
    pub submit: SubmitSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSection {
    #[serde(default = "default_project_name")]
    pub name: String,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: default_project_name(),
        }
    }
}

/// Which state point parameter holds the per-stage step counts whose sum is
/// the job's target step.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSection {
    #[serde(default = "default_target_param")]
    pub param: String,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            param: default_target_param(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressSection {
    #[serde(default = "default_artifact")]
    pub artifact: String,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            artifact: default_artifact(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputsSection {
    pub param: String,
    #[serde(default)]
    pub compounds: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitSection {
    #[serde(default = "default_submit_command")]
    pub command: Vec<String>,
    /// Binary invoked by submitted jobs. Defaults to the running executable.
    #[serde(default)]
    pub sweep_bin: Option<String>,
}

impl Default for SubmitSection {
    fn default() -> Self {
        Self {
            command: default_submit_command(),
            sweep_bin: None,
        }
    }
}

fn default_version() -> String {
    "0.1".to_string()
}

fn default_project_name() -> String {
    "sweep".to_string()
}

fn default_target_param() -> String {
    "n_steps".to_string()
}

fn default_artifact() -> String {
    "trajectory.jsonl".to_string()
}

fn default_submit_command() -> Vec<String> {
    vec!["sbatch".to_string()]
}

fn default_environment() -> HostEnvironment {
    HostEnvironment::named("local")
}

fn default_true() -> bool {
    true
}

pub fn parse_config(raw: &str, path: &Path) -> Result<SweepConfig, ConfigError> {
    let parse_err = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };
    let yaml_value: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
    let json_value: Value =
        serde_json::to_value(yaml_value).map_err(|e| parse_err(e.to_string()))?;
    serde_json::from_value(json_value).map_err(|e| parse_err(e.to_string()))
}

pub fn load_config(path: &Path) -> Result<SweepConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_config(&raw, path)
}

/// Walks up from `start` to the first directory holding a `sweep.yaml`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(p) = cur {
        if p.join(CONFIG_FILE).is_file() {
            return Some(p.to_path_buf());
        }
        cur = p.parent();
    }
    None
}

pub const CONFIG_TEMPLATE: &str = "\
version: '0.1'
project:
  name: my_project

# Every combination of the values below becomes one job.
# Mixtures need the extra brackets: input: [[\"PCBM-gaff\", \"P3HT-16-gaff\"]]
parameters:
  input: [[\"PCBM-gaff\"]]
  n_compounds: [[100]]
  density: [\"1.0_g-cm**3\"]
  e_factor: [1.0]
  forcefield: [\"gaff-custom\"]
  kT_reduced: [[1.0]]
  tau: [[1]]
  n_steps: [[1.0e7]]
  dt: [0.001]
  r_cut: [2.5]
  shrink_steps: [1.0e3]
  remove_hydrogens: [false]
  mode: [\"gpu\"]

target:
  param: n_steps

progress:
  artifact: trajectory.jsonl

inputs:
  param: input
  compounds: [\"PCBM-gaff\", \"P3HT-16-gaff\", \"ITIC-gaff\"]

operations:
  - name: sample
    kind: sample
    command: [python, -u, run_sim.py]
    directives:
      gpus: 1

environments: []
default_environment:
  name: local

submit:
  command: [sbatch]
";
