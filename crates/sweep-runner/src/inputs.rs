//! Fresh-start input resolution: every molecule named by the input parameter
//! must be a file under the project root or a known compound key.

use crate::config::InputsSection;
use crate::error::JobError;
use crate::registry::JobRecord;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct InputCheck {
    param: String,
    compounds: BTreeSet<String>,
    root: PathBuf,
}

impl InputCheck {
    pub fn new(section: &InputsSection, root: &Path) -> Self {
        Self {
            param: section.param.clone(),
            compounds: section.compounds.iter().cloned().collect(),
            root: root.to_path_buf(),
        }
    }

    pub fn check(&self, job: &JobRecord) -> Result<(), JobError> {
        let missing = |what: String| JobError::MissingInput {
            job: job.id.clone(),
            what,
        };
        let value = job
            .statepoint
            .get(&self.param)
            .ok_or_else(|| missing(format!("state point has no '{}' parameter", self.param)))?;
        let mut names = Vec::new();
        collect_strings(value, &mut names);
        if names.is_empty() {
            return Err(missing(format!("'{}' names no inputs", self.param)));
        }
        for name in names {
            if self.compounds.contains(name) || self.root.join(name).is_file() {
                continue;
            }
            return Err(missing(format!(
                "'{}' is neither a known compound key nor a file under {}",
                name,
                self.root.display()
            )));
        }
        Ok(())
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
