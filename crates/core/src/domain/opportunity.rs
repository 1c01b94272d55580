use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::actor::UserId;
use crate::domain::stage::StageId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpportunityId(pub i64);

impl std::fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    /// `None` means the opportunity sits in the unassigned pool.
    pub owner: Option<UserId>,
    pub current_stage: StageId,
    pub entered_stage_at: DateTime<Utc>,
    pub agreement_type: String,
    pub fields: BTreeMap<String, String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// The stage coordinates read at decision time; commits are guarded on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: StageId,
    pub entered_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn in_pool(&self) -> bool {
        self.owner.is_none()
    }

    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot { stage: self.current_stage, entered_at: self.entered_stage_at }
    }

    /// Returns the trimmed field value, treating blank values as missing.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|value| value.trim()).filter(|value| !value.is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOpportunity {
    pub agreement_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub owner: Option<UserId>,
    /// Entry stage; the first active stage by order when omitted.
    #[serde(default)]
    pub stage: Option<StageId>,
}
