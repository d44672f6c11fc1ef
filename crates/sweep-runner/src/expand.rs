//! Parameter space expansion.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sweep_core::{canonical_json, content_id};

/// Ordered mapping from parameter name to its candidate values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSpace {
    params: IndexMap<String, Vec<Value>>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter at the end of the declared order. Re-declaring a name
    /// replaces its candidates but keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<Value>) {
        self.params.insert(name.into(), values);
    }

    pub fn with(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.insert(name, values);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(|k| k.as_str())
    }

    pub fn values(&self, name: &str) -> Option<&[Value]> {
        self.params.get(name).map(|v| v.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// First parameter with no candidate values, if any.
    pub fn first_empty(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|(_, v)| v.is_empty())
            .map(|(k, _)| k.as_str())
    }

    /// Number of state points `expand` will produce.
    pub fn combinations(&self) -> usize {
        self.params.values().map(|v| v.len()).product()
    }

    /// Full Cartesian product in declared order, last parameter varying
    /// fastest. Any zero-length candidate list yields an empty result.
    pub fn expand(&self) -> Vec<StatePoint> {
        let total = self.combinations();
        let mut out = Vec::with_capacity(total);
        if total == 0 {
            return out;
        }
        let lists: Vec<(&String, &Vec<Value>)> = self.params.iter().collect();
        let mut cursor = vec![0usize; lists.len()];
        loop {
            let mut point = IndexMap::with_capacity(lists.len());
            for (slot, (name, values)) in lists.iter().enumerate() {
                point.insert((*name).clone(), values[cursor[slot]].clone());
            }
            out.push(StatePoint { params: point });

            let mut slot = lists.len();
            loop {
                if slot == 0 {
                    return out;
                }
                slot -= 1;
                cursor[slot] += 1;
                if cursor[slot] < lists[slot].1.len() {
                    break;
                }
                cursor[slot] = 0;
            }
        }
    }
}

/// One fully bound combination of sweep parameters. Immutable once a job is
/// created for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatePoint {
    params: IndexMap<String, Value>,
}

impl StatePoint {
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            params: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }

    pub fn canonical(&self) -> String {
        canonical_json(&self.to_value())
    }

    /// Content hash of the canonical serialization.
    pub fn id(&self) -> String {
        content_id(&self.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn space() -> ParameterSpace {
        ParameterSpace::new()
            .with("input", vec![json!(["PCBM-gaff"])])
            .with("kT", vec![json!(0.5), json!(1.0)])
            .with("mode", vec![json!("cpu"), json!("gpu")])
    }

    #[test]
    fn expands_full_product_in_declared_order() {
        let points = space().expand();
        assert_eq!(points.len(), 4);
        let names: Vec<&str> = points[0].params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["input", "kT", "mode"]);
        let combos: Vec<(Value, Value)> = points
            .iter()
            .map(|p| (p.get("kT").cloned().unwrap_or_default(), p.get("mode").cloned().unwrap_or_default()))
            .collect();
        assert_eq!(
            combos,
            vec![
                (json!(0.5), json!("cpu")),
                (json!(0.5), json!("gpu")),
                (json!(1.0), json!("cpu")),
                (json!(1.0), json!("gpu")),
            ]
        );
    }

    #[test]
    fn expansion_is_deterministic() {
        assert_eq!(space().expand(), space().expand());
    }

    #[test]
    fn zero_length_list_yields_empty_product() {
        let empty = space().with("density", vec![]);
        assert!(empty.expand().is_empty());
        assert_eq!(empty.first_empty(), Some("density"));
    }

    #[test]
    fn redeclared_parameter_keeps_position() {
        let s = space().with("input", vec![json!(["ITIC-gaff"])]);
        let names: Vec<&str> = s.names().collect();
        assert_eq!(names, vec!["input", "kT", "mode"]);
        assert_eq!(s.combinations(), 4);
    }

    #[test]
    fn identity_depends_on_content_not_order() {
        let a = StatePoint::from_pairs([("a", json!(1)), ("b", json!([2, 3]))]);
        let b = StatePoint::from_pairs([("b", json!([2, 3])), ("a", json!(1))]);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.id(), b.id());
        let c = StatePoint::from_pairs([("a", json!(1)), ("b", json!([3, 2]))]);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn statepoint_serializes_in_declared_order() {
        let p = StatePoint::from_pairs([("z", json!(1)), ("a", json!(2))]);
        let text = serde_json::to_string(&p).expect("serialize");
        assert_eq!(text, r#"{"z":1,"a":2}"#);
        let back: StatePoint = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, p);
    }
}
