//! Operation catalog.
//!
//! Operations are declared once (in `sweep.yaml`) and validated into an
//! immutable [`Catalog`]. Dependencies between operations are expressed only
//! through `satisfied: <op>` predicates; there is no separate graph.

use crate::environment::OperationDirectives;
use crate::error::ConfigError;
use crate::expand::ParameterSpace;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Boolean function of a job's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Current step has reached the document's target step.
    Sampled,
    /// All postconditions of the named operation hold.
    Satisfied(String),
    /// The job workspace contains this file.
    File(String),
    /// The document key is present and truthy.
    Doc(String),
    /// A state point parameter equals a value.
    Param { name: String, equals: Value },
    Not(Box<Predicate>),
}

impl Predicate {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Predicate)) {
        f(self);
        if let Predicate::Not(inner) = self {
            inner.visit(f);
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Predicate::Sampled => "sampled".to_string(),
            Predicate::Satisfied(op) => format!("satisfied({})", op),
            Predicate::File(name) => format!("file({})", name),
            Predicate::Doc(key) => format!("doc({})", key),
            Predicate::Param { name, equals } => format!("{} == {}", name, equals),
            Predicate::Not(inner) => format!("not {}", inner.describe()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Drives the resumable simulation; implicitly post-conditioned on
    /// `sampled`.
    Sample,
    #[default]
    Generic,
}

/// Operation as written in `sweep.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    #[serde(default)]
    pub kind: OperationKind,
    pub command: Vec<String>,
    #[serde(default)]
    pub pre: Vec<Predicate>,
    #[serde(default)]
    pub post: Vec<Predicate>,
    #[serde(default)]
    pub directives: OperationDirectives,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub kind: OperationKind,
    pub command: Vec<String>,
    pub pre: Vec<Predicate>,
    pub post: Vec<Predicate>,
    pub directives: OperationDirectives,
}

impl Operation {
    pub fn is_resumable(&self) -> bool {
        self.kind == OperationKind::Sample
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    ops: IndexMap<String, Operation>,
}

impl Catalog {
    pub fn build(specs: &[OperationSpec], space: &ParameterSpace) -> Result<Catalog, ConfigError> {
        let mut ops: IndexMap<String, Operation> = IndexMap::new();
        let mut sample_op: Option<String> = None;
        for spec in specs {
            if ops.contains_key(&spec.name) {
                return Err(ConfigError::DuplicateOperation(spec.name.clone()));
            }
            if spec.command.is_empty() {
                return Err(ConfigError::EmptyCommand(spec.name.clone()));
            }
            let mut post = spec.post.clone();
            if spec.kind == OperationKind::Sample {
                if let Some(existing) = &sample_op {
                    return Err(ConfigError::MultipleSampleOperations(
                        existing.clone(),
                        spec.name.clone(),
                    ));
                }
                sample_op = Some(spec.name.clone());
                if !post.contains(&Predicate::Sampled) {
                    post.insert(0, Predicate::Sampled);
                }
            }
            ops.insert(
                spec.name.clone(),
                Operation {
                    name: spec.name.clone(),
                    kind: spec.kind,
                    command: spec.command.clone(),
                    pre: spec.pre.clone(),
                    post,
                    directives: spec.directives.clone(),
                },
            );
        }

        for op in ops.values() {
            for pred in op.pre.iter().chain(op.post.iter()) {
                let mut err = None;
                pred.visit(&mut |p| {
                    if err.is_some() {
                        return;
                    }
                    match p {
                        Predicate::Satisfied(target) if target == &op.name => {
                            err = Some(ConfigError::SelfDependency(op.name.clone()));
                        }
                        Predicate::Satisfied(target) if !ops.contains_key(target) => {
                            err = Some(ConfigError::UnknownOperation {
                                op: target.clone(),
                                referrer: format!("operation '{}'", op.name),
                            });
                        }
                        Predicate::Param { name, .. } if !space.contains(name) => {
                            err = Some(ConfigError::UnknownParameter {
                                param: name.clone(),
                                referrer: format!("operation '{}'", op.name),
                            });
                        }
                        _ => {}
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            }
        }

        let catalog = Catalog { ops };
        catalog.check_cycles()?;
        Ok(catalog)
    }

    fn dependencies(op: &Operation) -> BTreeSet<&str> {
        let mut deps = BTreeSet::new();
        for pred in op.pre.iter().chain(op.post.iter()) {
            pred.visit(&mut |p| {
                if let Predicate::Satisfied(target) = p {
                    deps.insert(target.as_str());
                }
            });
        }
        deps
    }

    fn check_cycles(&self) -> Result<(), ConfigError> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: IndexMap<&str, u8> = self.ops.keys().map(|k| (k.as_str(), 0)).collect();
        let mut stack: Vec<&str> = Vec::new();
        for start in self.ops.keys() {
            self.visit_for_cycle(start, &mut state, &mut stack)?;
        }
        Ok(())
    }

    fn visit_for_cycle<'a>(
        &'a self,
        name: &'a str,
        state: &mut IndexMap<&'a str, u8>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), ConfigError> {
        match state.get(name).copied() {
            Some(2) => return Ok(()),
            Some(1) => {
                let from = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = stack[from..].iter().map(|s| s.to_string()).collect();
                cycle.push(name.to_string());
                return Err(ConfigError::DependencyCycle(cycle.join(" -> ")));
            }
            _ => {}
        }
        let Some(op) = self.ops.get(name) else {
            return Ok(());
        };
        state.insert(name, 1);
        stack.push(name);
        for dep in Self::dependencies(op) {
            self.visit_for_cycle(dep, state, stack)?;
        }
        stack.pop();
        state.insert(name, 2);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.ops.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.values()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Resolves an operation filter; unknown names are a configuration error.
    pub fn select(&self, names: &[String]) -> Result<Vec<&Operation>, ConfigError> {
        if names.is_empty() {
            return Ok(self.iter().collect());
        }
        names
            .iter()
            .map(|n| {
                self.get(n).ok_or_else(|| ConfigError::UnknownOperation {
                    op: n.clone(),
                    referrer: "the operation filter".to_string(),
                })
            })
            .collect()
    }
}
