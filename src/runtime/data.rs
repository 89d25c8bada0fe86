//! The parameter struct a leaf task's body is invoked with (§4.8 step
//! 1): resolved parameters, flattened predecessor outputs, the prior
//! memento if one was persisted, the rundir/srcdir pair, and the
//! resolved environment (including jobserver `MAKEFLAGS`, when held).

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::store::DataItem;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct TaskInput {
    pub params: BTreeMap<String, Value>,
    /// Flattened outputs of every `needs` producer, in `needs` order.
    pub inputs: Vec<DataItem>,
    pub memento: Option<String>,
    pub rundir: PathBuf,
    pub srcdir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl TaskInput {
    /// All inputs whose type/attrs satisfy `consumes` — the dataflow
    /// subset-match (§4.6) filtered to what this task actually asked for.
    pub fn matching_inputs(&self, consumes: &crate::model::ConsumesSpec) -> Vec<&DataItem> {
        if consumes.matches_anything() {
            return self.inputs.iter().collect();
        }
        if consumes.matches_none_output() {
            return Vec::new();
        }
        self.inputs
            .iter()
            .filter(|item| {
                consumes
                    .patterns()
                    .iter()
                    .any(|p| p.type_name == item.type_name && item.matches_pattern(&p.with))
            })
            .collect()
    }
}
