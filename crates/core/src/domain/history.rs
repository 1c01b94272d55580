use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::UserId;
use crate::domain::opportunity::OpportunityId;
use crate::domain::stage::StageId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryKind {
    StageChange,
    TimerEscalation,
    Claim,
    Release,
    Reassignment,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageChange => "STAGE_CHANGE",
            Self::TimerEscalation => "TIMER_ESCALATION",
            Self::Claim => "CLAIM",
            Self::Release => "RELEASE",
            Self::Reassignment => "REASSIGNMENT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "STAGE_CHANGE" => Some(Self::StageChange),
            "TIMER_ESCALATION" => Some(Self::TimerEscalation),
            "CLAIM" => Some(Self::Claim),
            "RELEASE" => Some(Self::Release),
            "REASSIGNMENT" => Some(Self::Reassignment),
            _ => None,
        }
    }
}

/// Append-only record written in the same commit as the mutation it describes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub opportunity_id: OpportunityId,
    /// `None` for system-initiated changes.
    pub actor: Option<UserId>,
    pub kind: HistoryKind,
    pub from_stage: Option<StageId>,
    pub to_stage: Option<StageId>,
    pub note: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        opportunity_id: OpportunityId,
        actor: Option<UserId>,
        kind: HistoryKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            opportunity_id,
            actor,
            kind,
            from_stage: None,
            to_stage: None,
            note: None,
            occurred_at,
        }
    }

    pub fn with_stages(mut self, from: StageId, to: StageId) -> Self {
        self.from_stage = Some(from);
        self.to_stage = Some(to);
        self
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::HistoryKind;

    #[test]
    fn history_kind_round_trips_from_storage_encoding() {
        let cases = [
            HistoryKind::StageChange,
            HistoryKind::TimerEscalation,
            HistoryKind::Claim,
            HistoryKind::Release,
            HistoryKind::Reassignment,
        ];

        for kind in cases {
            assert_eq!(HistoryKind::parse(kind.as_str()), Some(kind));
        }
    }
}
