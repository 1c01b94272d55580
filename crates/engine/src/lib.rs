pub mod audit;
pub mod cache;
pub mod clock;
pub mod notifier;
pub mod scheduler;
pub mod service;

pub use audit::TracingAuditSink;
pub use cache::CatalogCache;
pub use clock::{Clock, FixedClock, SystemClock};
pub use notifier::{
    notifier_from_config, HttpNotifier, NoopNotifier, Notifier, NotifierError, RecordingNotifier,
    StageChangeNotice,
};
pub use scheduler::EscalationScheduler;
pub use service::{FunnelService, RequestContext};
