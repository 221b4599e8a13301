//! Rendezvous client implementation.
//!
//! This module provides the gRPC client rank 0 uses to push the identifier
//! and the completion signal to peer endpoints.

use std::collections::HashMap;
use std::io::ErrorKind;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

use super::proto::rendezvous_service_client::RendezvousServiceClient;
use super::proto::{CompletionSignalRequest, SendVariableRequest};
use super::protocol::{CompletionAck, CompletionSignal, VariableAck, VariableMessage};
use crate::config::{RendezvousConfig, TimeoutConfig};
use crate::error::{RendezvousError, Result};
use crate::retry::{retry_async, RetryConfig, RetryResult};

// Log a still-unreachable peer at warn level every this many attempts.
const CONNECT_WARN_EVERY: u64 = 50;

/// Trait for rendezvous client implementations.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Push a named variable to the peer listening at `endpoint`.
    async fn send_variable(&self, endpoint: &str, message: VariableMessage)
        -> Result<VariableAck>;

    /// Tell the peer at `endpoint` that no more variables follow.
    async fn send_completion_signal(
        &self,
        endpoint: &str,
        signal: CompletionSignal,
    ) -> Result<CompletionAck>;

    /// Drop any connection state held for `endpoint`.
    async fn release(&self, _endpoint: &str) {}
}

/// gRPC-based rendezvous client.
///
/// Connections wait for the peer to come up: a refused connection is
/// retried at the configured poll interval until it succeeds, so callers
/// bound the whole exchange with their own deadline. Any other connect
/// failure is returned at once.
pub struct GrpcRpcClient {
    timeouts: TimeoutConfig,
    retry: RetryConfig,
    channels: RwLock<HashMap<String, Channel>>,
}

impl GrpcRpcClient {
    /// Create a new gRPC rendezvous client.
    pub fn new(config: &RendezvousConfig) -> Self {
        Self {
            timeouts: config.timeouts.clone(),
            retry: RetryConfig::from(&config.retry),
            channels: RwLock::new(HashMap::new()),
        }
    }

    async fn channel(&self, endpoint: &str) -> Result<Channel> {
        if let Some(channel) = self.channels.read().await.get(endpoint) {
            return Ok(channel.clone());
        }

        let channel = self.connect_when_ready(endpoint).await?;
        self.channels
            .write()
            .await
            .insert(endpoint.to_string(), channel.clone());
        Ok(channel)
    }

    async fn connect_when_ready(&self, endpoint: &str) -> Result<Channel> {
        let target = Endpoint::from_shared(format!("http://{}", endpoint))
            .map_err(|e| {
                RendezvousError::config_with_source(
                    format!("invalid peer endpoint '{}'", endpoint),
                    e,
                )
            })?
            .connect_timeout(self.timeouts.connect_timeout())
            .timeout(self.timeouts.request_timeout());

        let mut attempts: u64 = 0;
        loop {
            match target.connect().await {
                Ok(channel) => {
                    tracing::debug!(%endpoint, attempts, "connected to peer");
                    return Ok(channel);
                }
                Err(e) if awaiting_listener(&e) => {
                    attempts += 1;
                    if attempts % CONNECT_WARN_EVERY == 0 {
                        tracing::warn!(%endpoint, attempts, error = %e, "peer still unreachable");
                    } else {
                        tracing::trace!(%endpoint, attempts, error = %e, "peer not listening yet");
                    }
                    tokio::time::sleep(self.timeouts.connect_poll_interval()).await;
                }
                Err(e) => {
                    return Err(RendezvousError::transport_with_source(
                        endpoint,
                        "failed to connect",
                        e,
                    ));
                }
            }
        }
    }

    #[cfg(test)]
    async fn cached_channels(&self) -> usize {
        self.channels.read().await.len()
    }
}

/// True when the peer host answered but nothing accepts on the port yet.
fn awaiting_listener(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
            );
        }
        current = e.source();
    }
    false
}

/// Sorts a failed call into retryable and fatal outcomes.
fn classify<T>(endpoint: &str, operation: &str, status: Status) -> RetryResult<T, RendezvousError> {
    let transient = is_transient(status.code());
    let error = RendezvousError::transport_with_source(
        endpoint,
        format!("{} failed with {:?}", operation, status.code()),
        status,
    );
    if transient {
        RetryResult::Retry(error)
    } else {
        RetryResult::Fail(error)
    }
}

fn is_transient(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Unknown
    )
}

#[async_trait]
impl RpcClient for GrpcRpcClient {
    async fn send_variable(
        &self,
        endpoint: &str,
        message: VariableMessage,
    ) -> Result<VariableAck> {
        let channel = self.channel(endpoint).await?;
        let request = SendVariableRequest::from(message);

        let response = retry_async(&self.retry, || {
            let mut client = RendezvousServiceClient::new(channel.clone());
            let request = request.clone();
            async move {
                match client.send_variable(Request::new(request)).await {
                    Ok(response) => RetryResult::Ok(response.into_inner()),
                    Err(status) => classify(endpoint, "SendVariable", status),
                }
            }
        })
        .await?;

        Ok(VariableAck::from(response))
    }

    async fn send_completion_signal(
        &self,
        endpoint: &str,
        signal: CompletionSignal,
    ) -> Result<CompletionAck> {
        let channel = self.channel(endpoint).await?;
        let request = CompletionSignalRequest::from(signal);

        let response = retry_async(&self.retry, || {
            let mut client = RendezvousServiceClient::new(channel.clone());
            let request = request.clone();
            async move {
                match client.send_completion_signal(Request::new(request)).await {
                    Ok(response) => RetryResult::Ok(response.into_inner()),
                    Err(status) => classify(endpoint, "SendCompletionSignal", status),
                }
            }
        })
        .await?;

        Ok(CompletionAck::from(response))
    }

    async fn release(&self, endpoint: &str) {
        if self.channels.write().await.remove(endpoint).is_some() {
            tracing::trace!(%endpoint, "released peer channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::rpc::{EphemeralEndpoint, VariableHandler};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Refuses the first `failures` calls with a retryable error.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    impl VariableHandler for FlakyHandler {
        fn handle_variable(&self, message: VariableMessage) -> Result<VariableAck> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(RendezvousError::transport("peer", "busy"));
            }
            Ok(VariableAck {
                payload_len: message.payload.len() as u64,
            })
        }
    }

    fn message() -> VariableMessage {
        VariableMessage {
            session_id: "s".to_string(),
            sender_rank: 0,
            name: "NCCLID".to_string(),
            payload: vec![0; 4],
        }
    }

    fn retrying_config(max_retries: u32) -> RendezvousConfig {
        let mut config = RendezvousConfig::default();
        config.retry.max_retries = max_retries;
        config.retry.retry_delay_ms = 10;
        config.retry.max_retry_delay_ms = 50;
        config
    }

    async fn flaky_endpoint(failures: u32) -> (EphemeralEndpoint, Arc<FlakyHandler>, String) {
        let handler = Arc::new(FlakyHandler {
            failures,
            calls: AtomicU32::new(0),
        });
        let mut endpoint = EphemeralEndpoint::new("127.0.0.1:0", ServerConfig::default());
        endpoint.register_variable_handler(handler.clone());
        let addr = endpoint.start().await.unwrap();
        (endpoint, handler, addr.to_string())
    }

    #[test]
    fn test_awaiting_listener_only_for_refusals() {
        let refused = std::io::Error::from(ErrorKind::ConnectionRefused);
        assert!(awaiting_listener(&refused));

        let wrapped = RendezvousError::transport_with_source(
            "peer:1",
            "connect",
            std::io::Error::from(ErrorKind::ConnectionReset),
        );
        assert!(awaiting_listener(&wrapped));

        let dns = std::io::Error::new(ErrorKind::Other, "failed to lookup address");
        assert!(!awaiting_listener(&dns));
        assert!(!awaiting_listener(&RendezvousError::transport("peer:1", "no source")));
    }

    #[tokio::test]
    async fn test_unresolvable_peer_fails_fast() {
        let mut config = RendezvousConfig::default();
        config.timeouts.connect_timeout_ms = 2_000;
        let client = GrpcRpcClient::new(&config);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            client.send_variable("no-such-host.invalid:7000", message()),
        )
        .await
        .unwrap();
        match result {
            Err(RendezvousError::Transport { endpoint, .. }) => {
                assert_eq!(endpoint, "no-such-host.invalid:7000")
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_handler_error_is_retried() {
        let (mut endpoint, handler, addr) = flaky_endpoint(2).await;
        let client = GrpcRpcClient::new(&retrying_config(3));

        let ack = client.send_variable(&addr, message()).await.unwrap();
        assert_eq!(ack.payload_len, 4);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        endpoint.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_default_policy_fails_on_first_transient_error() {
        let (mut endpoint, handler, addr) = flaky_endpoint(1).await;
        let client = GrpcRpcClient::new(&RendezvousConfig::default());

        let result = client.send_variable(&addr, message()).await;
        assert!(matches!(result, Err(RendezvousError::Transport { .. })));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        endpoint.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_evicts_channel() {
        let (mut endpoint, _handler, addr) = flaky_endpoint(0).await;
        let client = GrpcRpcClient::new(&RendezvousConfig::default());

        client.send_variable(&addr, message()).await.unwrap();
        assert_eq!(client.cached_channels().await, 1);

        client.release(&addr).await;
        assert_eq!(client.cached_channels().await, 0);

        // Releasing an unknown peer is a no-op
        client.release("10.0.0.9:7000").await;

        endpoint.shutdown().await.unwrap();
    }

    #[test]
    fn test_transient_codes() {
        assert!(is_transient(Code::Unavailable));
        assert!(is_transient(Code::DeadlineExceeded));
        assert!(is_transient(Code::Unknown));
        assert!(!is_transient(Code::InvalidArgument));
        assert!(!is_transient(Code::FailedPrecondition));
        assert!(!is_transient(Code::Unimplemented));
    }

    #[test]
    fn test_classify_maps_to_transport_error() {
        let result: RetryResult<(), _> =
            classify("peer:1", "SendVariable", Status::unavailable("down"));
        assert!(result.should_retry());

        let result: RetryResult<(), _> = classify(
            "peer:1",
            "SendVariable",
            Status::invalid_argument("bad payload"),
        );
        assert!(!result.should_retry());
        match result.into_result() {
            Err(RendezvousError::Transport { endpoint, .. }) => assert_eq!(endpoint, "peer:1"),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_config_error() {
        let client = GrpcRpcClient::new(&RendezvousConfig::default());
        let result = client.send_variable("bad host:1", message()).await;
        assert!(matches!(result, Err(RendezvousError::Config { .. })));
    }
}
