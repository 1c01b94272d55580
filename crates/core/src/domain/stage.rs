use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::patch::Patch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub i64);

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    Advance,
    Exit,
}

impl StageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advance => "ADVANCE",
            Self::Exit => "EXIT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ADVANCE" => Some(Self::Advance),
            "EXIT" => Some(Self::Exit),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub order: i32,
    pub stage_type: StageType,
    pub idle_timeout_hours: Option<i64>,
    pub color: String,
    pub active: bool,
}

/// Longest idle timeout the catalog accepts: ten years.
pub const MAX_IDLE_TIMEOUT_HOURS: i64 = 24 * 365 * 10;

impl Stage {
    /// The stage's timer, if it has a usable one. Values outside what `Duration`
    /// represents count as no timer.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_hours.filter(|hours| *hours > 0).and_then(Duration::try_hours)
    }

    pub fn is_exit(&self) -> bool {
        self.stage_type == StageType::Exit
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStage {
    pub name: String,
    pub order: i32,
    pub stage_type: StageType,
    #[serde(default)]
    pub idle_timeout_hours: Option<i64>,
    pub color: String,
}

/// Partial update for a stage. Only `idle_timeout_hours` accepts an explicit null.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePatch {
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub name: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub order: Patch<i32>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub stage_type: Patch<StageType>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub idle_timeout_hours: Patch<i64>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub color: Patch<String>,
    #[serde(default, skip_serializing_if = "Patch::is_absent")]
    pub active: Patch<bool>,
}
