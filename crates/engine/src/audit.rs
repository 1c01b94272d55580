use tracing::{info, warn};

use embudo_core::audit::{AuditEvent, AuditOutcome, AuditSink};

/// Writes audit events to the process log as structured records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let opportunity_id =
            event.opportunity_id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string());
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();

        match event.outcome {
            AuditOutcome::Success => info!(
                event_name = %event.event_type,
                audit_event_id = %event.event_id,
                correlation_id = %event.correlation_id,
                opportunity_id = %opportunity_id,
                category = ?event.category,
                actor = %event.actor,
                outcome = ?event.outcome,
                metadata = %metadata,
                "audit event"
            ),
            AuditOutcome::Rejected | AuditOutcome::Conflict | AuditOutcome::Failed => warn!(
                event_name = %event.event_type,
                audit_event_id = %event.event_id,
                correlation_id = %event.correlation_id,
                opportunity_id = %opportunity_id,
                category = ?event.category,
                actor = %event.actor,
                outcome = ?event.outcome,
                metadata = %metadata,
                "audit event"
            ),
        }
    }
}
