pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod funnel;
pub mod patch;

pub use domain::actor::{Actor, Role, UserId};
pub use domain::agreement::{AgreementFieldRule, FieldRuleId, NewFieldRule};
pub use domain::history::{HistoryEntry, HistoryKind};
pub use domain::mutation::{ConditionalUpdate, OpportunityMutation};
pub use domain::opportunity::{NewOpportunity, Opportunity, OpportunityId, StageSnapshot};
pub use domain::stage::{NewStage, Stage, StageId, StagePatch, StageType};
pub use domain::transition::{NewTransition, Transition, TransitionId, TransitionPatch};
pub use errors::{ApplicationError, FunnelError, InterfaceError, ValidationFailure};
pub use funnel::{
    Capability, CapabilityTable, CatalogSnapshot, PoolPlanner, RuleEvaluator, SkipReason,
    SweepPhase, SweepReport,
};
pub use patch::Patch;
