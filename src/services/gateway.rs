//! Resilient wrapper for outbound persistence calls.
//!
//! The actual backend (HTTP, gRPC, whatever the host wires in) lives behind
//! the `PersistenceBackend` trait; this layer owns the retry policy and the
//! error classification. Idempotent operations retry with exponential
//! backoff and jitter; non-idempotent ones retry only when the caller
//! supplies an idempotency key, otherwise they execute at most once.

use crate::error::{ChatError, ChatResult};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    FetchConversation,
    FetchMessages,
    CreateConversation,
    UpdateConversationStatus,
    CreateMessage,
    UpdateMessage,
    DeleteMessage,
    AddReaction,
    RemoveReaction,
    MarkDelivered,
    MarkRead,
}

impl Operation {
    /// Safe to retry without a caller-supplied idempotency key. Reactions
    /// qualify: adds and removes both have set semantics.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Operation::FetchConversation
                | Operation::FetchMessages
                | Operation::AddReaction
                | Operation::RemoveReaction
                | Operation::MarkDelivered
                | Operation::MarkRead
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceRequest {
    pub operation: Operation,
    pub payload: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl PersistenceRequest {
    pub fn new(operation: Operation, payload: JsonValue) -> Self {
        Self {
            operation,
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Normalized backend failure: `{ message, code? }` plus the transport
/// status. Status 0 stands for a network-level fault (timeout, refused
/// connection) with no response at all.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("status {status}: {message}")]
pub struct BackendError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub status: u16,
}

impl BackendError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: 0,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status,
        }
    }
}

#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn execute(&self, request: &PersistenceRequest) -> Result<JsonValue, BackendError>;
}

/// Backend that accepts everything and persists nothing. For tests and
/// transport-less embedding.
pub struct NoopBackend;

#[async_trait]
impl PersistenceBackend for NoopBackend {
    async fn execute(&self, _request: &PersistenceRequest) -> Result<JsonValue, BackendError> {
        Ok(JsonValue::Null)
    }
}

/// Retry policy with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (plus or minus 30%).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

pub struct ApiGatewayClient {
    backend: Arc<dyn PersistenceBackend>,
    retry: RetryConfig,
}

impl ApiGatewayClient {
    pub fn new(backend: Arc<dyn PersistenceBackend>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    pub async fn call(&self, request: PersistenceRequest) -> ChatResult<JsonValue> {
        let retryable_request =
            request.operation.is_idempotent() || request.idempotency_key.is_some();

        let mut attempt = 0u32;
        let mut backoff = self.retry.initial_backoff;

        loop {
            match self.backend.execute(&request).await {
                Ok(value) => return Ok(value),
                Err(cause) => {
                    let classified = classify(&cause);
                    let exhausted = attempt >= self.retry.max_retries;
                    if !retryable_request || !classified.is_retryable() || exhausted {
                        tracing::error!(
                            operation = ?request.operation,
                            status = cause.status,
                            attempts = attempt + 1,
                            "persistence call failed: {}",
                            cause.message
                        );
                        if exhausted && classified.is_retryable() {
                            return Err(ChatError::TransientIo(format!(
                                "retries exhausted after {} attempts: {cause}",
                                attempt + 1
                            )));
                        }
                        return Err(classified);
                    }

                    attempt += 1;
                    let delay = apply_jitter(backoff, self.retry.jitter);
                    tracing::warn!(
                        operation = ?request.operation,
                        attempt,
                        max_retries = self.retry.max_retries,
                        ?delay,
                        "retrying persistence call"
                    );
                    tokio::time::sleep(delay).await;

                    backoff = Duration::from_millis(
                        ((backoff.as_millis() as f64 * self.retry.backoff_multiplier)
                            .min(self.retry.max_backoff.as_millis() as f64))
                            as u64,
                    );
                }
            }
        }
    }
}

/// Maps a normalized backend failure onto the error taxonomy: auth 4xx to
/// PermissionDenied, other 4xx permanent, 5xx and network faults transient.
fn classify(err: &BackendError) -> ChatError {
    match err.status {
        401 | 403 => ChatError::PermissionDenied(err.message.clone()),
        404 => ChatError::NotFound(err.message.clone()),
        400..=499 => ChatError::PermanentIo(err.to_string()),
        _ => ChatError::TransientIo(err.to_string()),
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let factor: f64 = rand::rng().random_range(0.7..1.3);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with the given status, then
    /// succeeds.
    struct FlakyBackend {
        failures: u32,
        status: u16,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn new(failures: u32, status: u16) -> Self {
            Self {
                failures,
                status,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PersistenceBackend for FlakyBackend {
        async fn execute(&self, _request: &PersistenceRequest) -> Result<JsonValue, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(BackendError::http(self.status, "boom"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[tokio::test]
    async fn idempotent_operation_retries_transient_failures() {
        let backend = Arc::new(FlakyBackend::new(2, 503));
        let client = ApiGatewayClient::new(backend.clone(), fast_retry());

        let result = client
            .call(PersistenceRequest::new(Operation::MarkRead, json!({})))
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_idempotent_operation_executes_at_most_once() {
        let backend = Arc::new(FlakyBackend::new(1, 503));
        let client = ApiGatewayClient::new(backend.clone(), fast_retry());

        let err = client
            .call(PersistenceRequest::new(
                Operation::UpdateConversationStatus,
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idempotency_key_makes_mutation_retryable() {
        let backend = Arc::new(FlakyBackend::new(1, 503));
        let client = ApiGatewayClient::new(backend.clone(), fast_retry());

        client
            .call(
                PersistenceRequest::new(Operation::UpdateConversationStatus, json!({}))
                    .with_key("txn-1"),
            )
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_never_retried() {
        let backend = Arc::new(FlakyBackend::new(5, 422));
        let client = ApiGatewayClient::new(backend.clone(), fast_retry());

        let err = client
            .call(PersistenceRequest::new(Operation::FetchMessages, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermanentIo(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_wrap_the_final_cause() {
        let backend = Arc::new(FlakyBackend::new(10, 500));
        let client = ApiGatewayClient::new(backend.clone(), fast_retry());

        let err = client
            .call(PersistenceRequest::new(Operation::FetchMessages, json!({})))
            .await
            .unwrap_err();
        match err {
            ChatError::TransientIo(msg) => {
                assert!(msg.contains("retries exhausted"), "got: {msg}");
                assert!(msg.contains("boom"), "got: {msg}");
            }
            other => panic!("expected TransientIo, got {other:?}"),
        }
        // Initial attempt plus three retries.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn auth_failures_map_to_permission_denied() {
        assert!(matches!(
            classify(&BackendError::http(401, "no token")),
            ChatError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify(&BackendError::http(404, "gone")),
            ChatError::NotFound(_)
        ));
        assert!(matches!(
            classify(&BackendError::network("timed out")),
            ChatError::TransientIo(_)
        ));
    }
}
