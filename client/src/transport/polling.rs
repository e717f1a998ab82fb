//! HTTP transport: `POST /sync` to push, `GET /sync` to pull.
//!
//! The transport only issues requests; the engine's interval timer decides
//! when to poll and its backoff decides when to retry.

use super::SyncTransport;
use crate::config::{SyncConfig, TransportKind};
use crate::error::{ConfigError, TransportError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tandem_engine::{AckResult, Rejection, SyncBatch, Watermark};
use tracing::{debug, warn};

/// Polling HTTP transport.
#[derive(Debug, Clone)]
pub struct PollingHttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl PollingHttpTransport {
    pub fn new(config: &SyncConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigError::Invalid {
                name: "serverUrl",
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            timeout: config.request_timeout(),
        })
    }

    fn sync_url(&self) -> String {
        format!("{}/sync", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else {
                    TransportError::rejected(format!("undecodable response: {e}"))
                }
            });
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, &body);
        warn!(%status, error = %err, "authority refused request");
        Err(err)
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Unreachable(err.to_string())
        }
    }
}

/// Map a non-success HTTP status to a transport error.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> TransportError {
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return TransportError::Timeout(Duration::ZERO);
    }
    if status.is_server_error() {
        return TransportError::Unreachable(format!("authority returned {status}"));
    }
    match serde_json::from_str::<Rejection>(body) {
        Ok(rejection) => TransportError::Rejected {
            message: rejection.reason,
            rejected: rejection.rejected,
        },
        Err(_) if body.trim().is_empty() => TransportError::rejected(status.to_string()),
        Err(_) => TransportError::rejected(format!("{status}: {}", body.trim())),
    }
}

#[async_trait]
impl SyncTransport for PollingHttpTransport {
    async fn push(&self, batch: SyncBatch) -> Result<AckResult, TransportError> {
        debug!(entries = batch.entries.len(), "POST /sync");
        self.send(self.client.post(self.sync_url()).json(&batch))
            .await
    }

    async fn pull(&self, since: &Watermark, limit: usize) -> Result<SyncBatch, TransportError> {
        let mut query = vec![("limit", limit.to_string())];
        if !since.is_empty() {
            query.push(("since", since.to_string()));
        }
        debug!(%since, limit, "GET /sync");
        self.send(self.client.get(self.sync_url()).query(&query))
            .await
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_unreachable() {
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            TransportError::Unreachable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, ""),
            TransportError::Timeout(_)
        ));
    }

    #[test]
    fn rejection_body_is_parsed() {
        let body = r#"{"error":"1 of 1 entries refused","rejected":[{"index":0,"collection":"tickets","recordId":"t1","reason":"missing required field: title"}]}"#;
        match classify_status(StatusCode::UNPROCESSABLE_ENTITY, body) {
            TransportError::Rejected { message, rejected } => {
                assert_eq!(message, "1 of 1 entries refused");
                assert_eq!(rejected[0].record_id, "t1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_client_errors_are_rejected() {
        match classify_status(StatusCode::UNAUTHORIZED, r#"{"error":"Unauthorized"}"#) {
            TransportError::Rejected { message, .. } => assert_eq!(message, "Unauthorized"),
            other => panic!("unexpected {other:?}"),
        }
        match classify_status(StatusCode::NOT_FOUND, "") {
            TransportError::Rejected { message, .. } => assert!(message.contains("404")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = SyncConfig {
            server_url: format!("http://{addr}"),
            request_timeout_ms: 2000,
            ..SyncConfig::default()
        };
        let transport = PollingHttpTransport::new(&config).unwrap();
        let err = transport
            .push(SyncBatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)), "{err:?}");
    }
}
