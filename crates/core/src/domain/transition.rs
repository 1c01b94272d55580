use serde::{Deserialize, Serialize};

use crate::domain::stage::StageId;
use crate::patch::Patch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransitionId(pub i64);

impl std::fmt::Display for TransitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directed edge between two stages, carrying the rules a manual move must satisfy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub origin_stage: StageId,
    pub destination_stage: StageId,
    pub action_name: String,
    pub requires_note: bool,
    pub requires_supervisor: bool,
    pub returns_to_pool: bool,
    /// Marks the edge the escalation scheduler fires when the origin stage times out.
    pub is_default: bool,
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransition {
    pub origin_stage: StageId,
    pub destination_stage: StageId,
    pub action_name: String,
    #[serde(default = "default_true")]
    pub requires_note: bool,
    #[serde(default)]
    pub requires_supervisor: bool,
    #[serde(default)]
    pub returns_to_pool: bool,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPatch {
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub destination_stage: Patch<StageId>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub action_name: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub requires_note: Patch<bool>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub requires_supervisor: Patch<bool>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub returns_to_pool: Patch<bool>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub is_default: Patch<bool>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub active: Patch<bool>,
}
