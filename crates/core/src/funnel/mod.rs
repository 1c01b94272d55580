pub mod capability;
pub mod catalog;
pub mod escalation;
pub mod fields;
pub mod pool;
pub mod rules;

pub use capability::{Capability, CapabilityTable};
pub use catalog::CatalogSnapshot;
pub use escalation::{SkipReason, SweepPhase, SweepReport, SweepSkip};
pub use pool::PoolPlanner;
pub use rules::{RuleEvaluator, TransitionAuthorization};
