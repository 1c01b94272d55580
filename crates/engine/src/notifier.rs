use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use embudo_core::config::MessagingConfig;
use embudo_core::domain::actor::UserId;
use embudo_core::domain::history::HistoryKind;
use embudo_core::domain::opportunity::OpportunityId;
use embudo_core::domain::stage::StageId;

const STAGE_CHANGE_PATH: &str = "/notifications/stage-change";
const SERVICE_SECRET_HEADER: &str = "x-service-secret";

/// What the messaging collaborator hears about after a stage move commits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChangeNotice {
    pub opportunity_id: OpportunityId,
    pub stage_id: StageId,
    pub previous_stage_id: StageId,
    pub owner: Option<UserId>,
    pub kind: HistoryKind,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Fire-and-forget sink. Implementations must not block the caller on delivery and
/// must never surface delivery failures; the commit has already happened.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn stage_changed(&self, notice: StageChangeNotice);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn stage_changed(&self, notice: StageChangeNotice) {
        debug!(
            event_name = "notify.stage_change.skipped",
            opportunity_id = %notice.opportunity_id,
            "messaging disabled; stage change not forwarded"
        );
    }
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("messaging is enabled but `{0}` is not configured")]
    MissingSetting(&'static str),
    #[error("failed to build messaging http client: {0}")]
    Client(#[from] reqwest::Error),
}

struct HttpTarget {
    client: reqwest::Client,
    endpoint: String,
    secret: SecretString,
}

/// Posts stage changes to the messaging service on a detached task.
#[derive(Clone)]
pub struct HttpNotifier {
    target: Arc<HttpTarget>,
}

impl HttpNotifier {
    pub fn new(
        base_url: &str,
        secret: SecretString,
        timeout: Duration,
    ) -> Result<Self, NotifierError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!("{}{STAGE_CHANGE_PATH}", base_url.trim_end_matches('/'));
        Ok(Self { target: Arc::new(HttpTarget { client, endpoint, secret }) })
    }

    pub fn endpoint(&self) -> &str {
        &self.target.endpoint
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn stage_changed(&self, notice: StageChangeNotice) {
        let target = Arc::clone(&self.target);
        tokio::spawn(async move {
            let result = target
                .client
                .post(&target.endpoint)
                .header(SERVICE_SECRET_HEADER, target.secret.expose_secret())
                .json(&notice)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        event_name = "notify.stage_change.delivered",
                        opportunity_id = %notice.opportunity_id,
                        correlation_id = %notice.correlation_id,
                        "stage change delivered to messaging"
                    );
                }
                Ok(response) => {
                    warn!(
                        event_name = "notify.stage_change.rejected",
                        opportunity_id = %notice.opportunity_id,
                        correlation_id = %notice.correlation_id,
                        status = %response.status(),
                        "messaging service rejected stage change"
                    );
                }
                Err(error) => {
                    warn!(
                        event_name = "notify.stage_change.failed",
                        opportunity_id = %notice.opportunity_id,
                        correlation_id = %notice.correlation_id,
                        error = %error,
                        "stage change notification failed"
                    );
                }
            }
        });
    }
}

/// Keeps every notice in memory. Used by tests and dry runs.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<StageChangeNotice>>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<StageChangeNotice> {
        match self.notices.lock() {
            Ok(notices) => notices.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn stage_changed(&self, notice: StageChangeNotice) {
        match self.notices.lock() {
            Ok(mut notices) => notices.push(notice),
            Err(poisoned) => poisoned.into_inner().push(notice),
        }
    }
}

/// Picks the notifier for `config`: HTTP when messaging is enabled, no-op otherwise.
pub fn notifier_from_config(config: &MessagingConfig) -> Result<Arc<dyn Notifier>, NotifierError> {
    if !config.enabled {
        return Ok(Arc::new(NoopNotifier));
    }
    let base_url = config.base_url.as_deref().ok_or(NotifierError::MissingSetting("base_url"))?;
    let secret =
        config.service_secret.clone().ok_or(NotifierError::MissingSetting("service_secret"))?;
    let notifier = HttpNotifier::new(base_url, secret, Duration::from_secs(config.timeout_secs))?;
    Ok(Arc::new(notifier))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use embudo_core::config::MessagingConfig;
    use secrecy::SecretString;

    use super::{notifier_from_config, HttpNotifier, NotifierError};

    fn messaging(enabled: bool, base_url: Option<&str>, secret: Option<&str>) -> MessagingConfig {
        MessagingConfig {
            enabled,
            base_url: base_url.map(str::to_string),
            service_secret: secret.map(|value| SecretString::from(value.to_string())),
            timeout_secs: 5,
        }
    }

    #[test]
    fn endpoint_joins_base_url_without_double_slash() {
        let notifier = HttpNotifier::new(
            "http://mensajeria.local/",
            SecretString::from("s3cret".to_string()),
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(notifier.endpoint(), "http://mensajeria.local/notifications/stage-change");
    }

    #[test]
    fn disabled_messaging_builds_a_noop() {
        assert!(notifier_from_config(&messaging(false, None, None)).is_ok());
    }

    #[test]
    fn enabled_messaging_requires_a_secret() {
        let error = notifier_from_config(&messaging(true, Some("http://mensajeria.local"), None))
            .err()
            .expect("missing secret");
        assert!(matches!(error, NotifierError::MissingSetting("service_secret")));
    }
}
