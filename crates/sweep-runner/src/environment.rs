//! Host environment resolution.
//!
//! A table of host patterns to directive bundles replaces per-cluster
//! environment classes. Resolution is total: an unrecognized host gets the
//! fallback bundle.

use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;

/// Resource bundle for one execution host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostEnvironment {
    pub name: String,
    /// Regex matched against the start of the host name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Upper bound on accelerators per task; `None` means no cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpus: Option<u32>,
    /// Prefix for every operation command, e.g. a container exec.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wrapper: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_flags: Vec<String>,
}

impl HostEnvironment {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn cluster(name: &str, pattern: &str, partition: &str) -> Self {
        Self {
            name: name.to_string(),
            host_pattern: Some(pattern.to_string()),
            partition: Some(partition.to_string()),
            ..Self::default()
        }
    }
}

/// Per-operation resource requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationDirectives {
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

/// Clusters known without any configuration.
pub fn builtin_environments() -> Vec<HostEnvironment> {
    vec![
        HostEnvironment::cluster("bridges", r".*\.bridges\.psc\.edu", "GPU-shared"),
        HostEnvironment::cluster("comet", r"comet", "gpu-shared"),
        HostEnvironment::cluster("fry", r"fry", "batch"),
        HostEnvironment::cluster("kestrel", r"kestrel", "batch"),
    ]
}

#[derive(Debug, Clone)]
pub struct EnvironmentTable {
    entries: Vec<(Regex, HostEnvironment)>,
    fallback: HostEnvironment,
}

impl EnvironmentTable {
    /// Configured entries are tried first, in order, then the built-in ones.
    pub fn build(
        configured: &[HostEnvironment],
        fallback: HostEnvironment,
        include_builtin: bool,
    ) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        let builtin = if include_builtin {
            builtin_environments()
        } else {
            Vec::new()
        };
        for env in configured.iter().chain(builtin.iter()) {
            let Some(pattern) = env.host_pattern.as_deref() else {
                continue;
            };
            let re = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| {
                ConfigError::InvalidHostPattern {
                    name: env.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            entries.push((re, env.clone()));
        }
        Ok(Self { entries, fallback })
    }

    pub fn resolve(&self, host: &str) -> &HostEnvironment {
        self.entries
            .iter()
            .find(|(re, _)| re.is_match(host))
            .map(|(_, env)| env)
            .unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &HostEnvironment {
        &self.fallback
    }
}

/// Best-effort name of the machine we are running on.
pub fn detect_host(explicit: Option<&str>) -> String {
    if let Some(h) = explicit.filter(|h| !h.trim().is_empty()) {
        return h.trim().to_string();
    }
    for var in ["SWEEP_HOST", "HOSTNAME"] {
        if let Ok(h) = std::env::var(var) {
            if !h.trim().is_empty() {
                return h.trim().to_string();
            }
        }
    }
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Directives attached to one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Directives {
    pub environment: String,
    pub gpus: u32,
    pub wrapper: Vec<String>,
    pub partition: Option<String>,
    pub extra_flags: Vec<String>,
}

impl Directives {
    pub fn resolve(env: &HostEnvironment, op: &OperationDirectives) -> Self {
        let gpus = match env.max_gpus {
            Some(cap) => op.gpus.min(cap),
            None => op.gpus,
        };
        let mut extra_flags = env.extra_flags.clone();
        extra_flags.extend(op.extra_flags.iter().cloned());
        Self {
            environment: env.name.clone(),
            gpus,
            wrapper: env.wrapper.clone(),
            partition: env.partition.clone(),
            extra_flags,
        }
    }

    /// Wrapper followed by the operation's own command.
    pub fn wrap(&self, command: &[String]) -> Vec<String> {
        let mut out = self.wrapper.clone();
        out.extend(command.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> EnvironmentTable {
        let configured = vec![HostEnvironment {
            name: "fry-container".to_string(),
            host_pattern: Some("fry".to_string()),
            partition: Some("gpuq".to_string()),
            max_gpus: Some(2),
            wrapper: vec!["singularity".into(), "exec".into(), "--nv".into(), "sim.sif".into()],
            extra_flags: vec!["--time=24:00:00".into()],
        }];
        EnvironmentTable::build(&configured, HostEnvironment::named("local"), true).expect("table")
    }

    #[test]
    fn unrecognized_host_resolves_to_fallback() {
        assert_eq!(table().resolve("my-laptop").name, "local");
        assert_eq!(table().resolve("").name, "local");
    }

    #[test]
    fn configured_entries_win_over_builtin() {
        let t = table();
        assert_eq!(t.resolve("fry.boisestate.edu").name, "fry-container");
        assert_eq!(t.resolve("kestrel01").partition.as_deref(), Some("batch"));
        assert_eq!(t.resolve("br005.bridges.psc.edu").partition.as_deref(), Some("GPU-shared"));
    }

    #[test]
    fn patterns_are_anchored_at_start() {
        assert_eq!(table().resolve("notfry").name, "local");
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let bad = vec![HostEnvironment {
            host_pattern: Some("(".to_string()),
            ..HostEnvironment::named("broken")
        }];
        let err = EnvironmentTable::build(&bad, HostEnvironment::named("local"), false)
            .expect_err("bad regex");
        assert!(matches!(err, ConfigError::InvalidHostPattern { .. }));
    }

    #[test]
    fn directives_cap_gpus_and_wrap_command() {
        let t = table();
        let env = t.resolve("fry");
        let d = Directives::resolve(
            env,
            &OperationDirectives {
                gpus: 4,
                extra_flags: vec!["--mem=8G".into()],
            },
        );
        assert_eq!(d.gpus, 2);
        assert_eq!(d.extra_flags, vec!["--time=24:00:00".to_string(), "--mem=8G".to_string()]);
        let cmd = d.wrap(&["python".to_string(), "-u".to_string(), "run_sim.py".to_string()]);
        assert_eq!(cmd[0], "singularity");
        assert_eq!(cmd.last().map(|s| s.as_str()), Some("run_sim.py"));

        let local = Directives::resolve(t.fallback(), &OperationDirectives { gpus: 1, extra_flags: vec![] });
        assert_eq!(local.gpus, 1);
        assert!(local.wrapper.is_empty());
    }

    #[test]
    fn explicit_host_takes_precedence() {
        assert_eq!(detect_host(Some(" fry ")), "fry");
        assert!(!detect_host(None).is_empty());
    }
}
