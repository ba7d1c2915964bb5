use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use url::Url;
use uuid::Uuid;

use crate::config::{GatewayKind, GatewaySettings};
use crate::models::{AutosaveRequest, SaveConfirmation};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("autosave request timed out after {0:?}")]
    Timeout(Duration),
    #[error("autosave transport error: {0}")]
    Transport(String),
    #[error("autosave endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("autosave rejected by server: {0}")]
    Rejected(String),
    #[error("invalid autosave response: {0}")]
    Decode(String),
}

/// Boundary to the backend autosave endpoint.
///
/// Implementations must be cancel-safe: the scheduler drops the future when
/// an attempt is superseded.
#[async_trait]
pub trait SaveGateway: Send + Sync {
    async fn send(&self, request: &AutosaveRequest) -> Result<SaveConfirmation, GatewayError>;
}

/// Supplies the bearer token attached to save requests.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub struct HttpSaveGateway {
    http_client: Client,
    endpoint: Url,
    credentials: Arc<dyn CredentialProvider>,
    timeout: Duration,
}

impl HttpSaveGateway {
    pub fn new(
        api_base_url: &Url,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(&format!(
            "{}/autosave",
            api_base_url.as_str().trim_end_matches('/')
        ))
        .context("Invalid autosave endpoint URL")?;

        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            endpoint,
            credentials,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn classify(&self, error: reqwest::Error) -> GatewayError {
        if error.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else if error.is_decode() {
            GatewayError::Decode(error.to_string())
        } else {
            GatewayError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl SaveGateway for HttpSaveGateway {
    async fn send(&self, request: &AutosaveRequest) -> Result<SaveConfirmation, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        tracing::debug!(
            "POST {} request_id={} changes={}",
            self.endpoint,
            request_id,
            request.changes.len()
        );

        let mut builder = self
            .http_client
            .post(self.endpoint.clone())
            .header(REQUEST_ID_HEADER, &request_id)
            .json(request);
        if let Some(token) = self.credentials.bearer_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let confirmation: SaveConfirmation =
            response.json().await.map_err(|e| match self.classify(e) {
                GatewayError::Transport(msg) => GatewayError::Decode(msg),
                other => other,
            })?;

        if !confirmation.success {
            return Err(GatewayError::Rejected(
                confirmation
                    .message
                    .clone()
                    .unwrap_or_else(|| "save was not acknowledged".to_string()),
            ));
        }

        Ok(confirmation)
    }
}

/// In-process gateway for offline development and demos.
#[derive(Debug, Clone)]
pub struct MockSaveGateway {
    latency: Duration,
    failure_rate: f64,
}

impl MockSaveGateway {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl SaveGateway for MockSaveGateway {
    async fn send(&self, request: &AutosaveRequest) -> Result<SaveConfirmation, GatewayError> {
        tokio::time::sleep(self.latency).await;

        if self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate {
            return Err(GatewayError::Transport(
                "simulated network failure".to_string(),
            ));
        }

        Ok(SaveConfirmation {
            success: true,
            timestamp: Some(Utc::now()),
            saved: request.changes.len() as u32,
            message: None,
        })
    }
}

/// Builds the gateway selected by configuration.
pub fn build_gateway(
    settings: &GatewaySettings,
    request_timeout: Duration,
) -> Result<Arc<dyn SaveGateway>> {
    match settings.kind {
        GatewayKind::Http => {
            let credentials = Arc::new(StaticToken::new(settings.auth_token.clone()));
            let gateway = HttpSaveGateway::new(&settings.api_base_url, credentials, request_timeout)?;
            tracing::info!("Using HTTP autosave gateway at {}", gateway.endpoint());
            Ok(Arc::new(gateway))
        }
        GatewayKind::Mock => {
            tracing::info!(
                "Using mock autosave gateway (latency {:?}, failure rate {})",
                settings.mock_latency,
                settings.mock_failure_rate
            );
            Ok(Arc::new(MockSaveGateway::new(
                settings.mock_latency,
                settings.mock_failure_rate,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMetadata;

    fn request(changes: usize) -> AutosaveRequest {
        AutosaveRequest {
            exam_quiz_id: "exam".to_string(),
            user_id: "user".to_string(),
            changes: (0..changes)
                .map(|i| crate::models::PendingChange {
                    question_id: format!("q{}", i),
                    selected_answers: vec![],
                    is_flagged: false,
                    timestamp: Utc::now(),
                })
                .collect(),
            session_data: SessionMetadata::default(),
        }
    }

    #[test]
    fn endpoint_is_appended_to_base_path() {
        let base = Url::parse("http://localhost:8081/api/").unwrap();
        let gateway =
            HttpSaveGateway::new(&base, Arc::new(StaticToken::default()), Duration::from_secs(1))
                .unwrap();
        assert_eq!(gateway.endpoint().as_str(), "http://localhost:8081/api/autosave");
    }

    #[test]
    fn empty_token_is_ignored() {
        assert_eq!(StaticToken::new(Some(String::new())).bearer_token(), None);
        assert_eq!(
            StaticToken::new(Some("t".to_string())).bearer_token(),
            Some("t".to_string())
        );
    }

    #[tokio::test]
    async fn mock_gateway_confirms_every_change() {
        let gateway = MockSaveGateway::new(Duration::ZERO, 0.0);
        let confirmation = gateway.send(&request(3)).await.unwrap();
        assert!(confirmation.success);
        assert_eq!(confirmation.saved, 3);
    }

    #[tokio::test]
    async fn mock_gateway_can_always_fail() {
        let gateway = MockSaveGateway::new(Duration::ZERO, 1.0);
        let err = gateway.send(&request(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
    }
}
