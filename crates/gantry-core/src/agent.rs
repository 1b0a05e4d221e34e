//! Agent types.

use crate::ids::AgentId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An execution resource with capability labels.
///
/// Agents are owned by an external provider; the engine only ever holds
/// exclusive leases on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Agent {
    pub id: AgentId,
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub busy: bool,
}

impl Agent {
    pub fn new<I, S>(id: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: AgentId::new(id),
            labels: labels.into_iter().map(Into::into).collect(),
            busy: false,
        }
    }

    /// True when this agent carries every required label.
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.labels)
    }

    pub fn is_available(&self) -> bool {
        !self.busy
    }
}
