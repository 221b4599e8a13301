// rust/rendezvous-core/src/coordinator.rs

//! Rendezvous entry point.
//!
//! [`RendezvousCoordinator::run`] either broadcasts a fresh identifier to
//! every peer (rank 0) or serves a single-use endpoint until rank 0 has
//! delivered it (any other rank). Every call works in its own child scope,
//! so the identifier never stays discoverable after the call returns.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::time::Instant;
use uuid::Uuid;

use crate::barrier::{BarrierKind, BarrierMonitor, BarrierRelease};
use crate::config::{parse_endpoint, RendezvousConfig, RendezvousSettings};
use crate::error::{RendezvousError, Result};
use crate::identifier::{default_generator, IdGenerator, UniqueId, UNIQUE_ID_BYTES};
use crate::rpc::{
    BarrierCompletionHandler, CompletionSignal, EphemeralEndpoint, GrpcRpcClient, RpcClient,
    ScopeVariableHandler, VariableMessage,
};
use crate::scope::{LocalScope, Scope};

/// Per-call invocation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RendezvousRequest {
    /// 0 broadcasts, anything else receives.
    pub rank: u32,
    /// Listen address; required when receiving.
    pub endpoint: String,
    /// Peers to broadcast to; ignored when receiving.
    pub other_endpoints: Vec<String>,
}

impl From<&RendezvousSettings> for RendezvousRequest {
    fn from(settings: &RendezvousSettings) -> Self {
        Self {
            rank: settings.rank,
            endpoint: settings.endpoint.clone(),
            other_endpoints: settings.other_endpoints.clone(),
        }
    }
}

/// Progress of a receiving rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePhase {
    Idle,
    ServerStarting,
    WaitingForSignal,
    Signaled,
    ShuttingDown,
    Done,
}

impl fmt::Display for ReceivePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct ReceiveProgress<'a> {
    endpoint: &'a str,
    phase: ReceivePhase,
}

impl<'a> ReceiveProgress<'a> {
    fn new(endpoint: &'a str) -> Self {
        Self {
            endpoint,
            phase: ReceivePhase::Idle,
        }
    }

    fn advance(&mut self, next: ReceivePhase) {
        tracing::debug!(endpoint = %self.endpoint, from = %self.phase, to = %next, "receive phase");
        self.phase = next;
    }
}

/// Drives one rendezvous per [`run`](Self::run) call.
///
/// Collaborators default to the gRPC client, [`default_generator`] and a
/// fresh root scope; each can be swapped with the `with_*` builders.
pub struct RendezvousCoordinator {
    config: RendezvousConfig,
    generator: Arc<dyn IdGenerator>,
    client: Arc<dyn RpcClient>,
    scope: Arc<Scope>,
}

impl RendezvousCoordinator {
    /// Create a coordinator from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Config`] if `config` is invalid.
    pub fn new(config: RendezvousConfig) -> Result<Self> {
        config.validate()?;
        let client: Arc<dyn RpcClient> = Arc::new(GrpcRpcClient::new(&config));
        Ok(Self {
            config,
            generator: default_generator(),
            client,
            scope: Scope::new_root(),
        })
    }

    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.generator = generator;
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn RpcClient>) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Arc<Scope>) -> Self {
        self.scope = scope;
        self
    }

    /// Long-lived scope each call's child scope hangs off.
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Runs one rendezvous and returns the shared identifier.
    ///
    /// # Errors
    ///
    /// Any failure aborts the whole call. See [`RendezvousError`] for the
    /// categories.
    pub async fn run(&self, request: &RendezvousRequest) -> Result<UniqueId> {
        let local = self.scope.new_child();

        tracing::info!(
            rank = request.rank,
            endpoint = %request.endpoint,
            peers = request.other_endpoints.len(),
            "starting rendezvous"
        );

        let result = if request.rank == 0 {
            self.broadcast(&local, &request.other_endpoints).await
        } else {
            if request.endpoint.is_empty() {
                return Err(RendezvousError::config(format!(
                    "rank {} needs an endpoint to listen on",
                    request.rank
                )));
            }
            self.receive(&local, &request.endpoint).await
        };

        match &result {
            Ok(id) => tracing::info!(rank = request.rank, id = ?id, "rendezvous complete"),
            Err(e) => tracing::error!(rank = request.rank, error = %e, "rendezvous failed"),
        }
        result
    }

    async fn broadcast(&self, scope: &Scope, peers: &[String]) -> Result<UniqueId> {
        let mut seen = HashSet::new();
        for peer in peers {
            parse_endpoint(peer)?;
            if !seen.insert(peer.as_str()) {
                return Err(RendezvousError::config(format!(
                    "duplicate peer endpoint '{}'",
                    peer
                )));
            }
        }

        let id = self.generator.generate()?;
        let name = self.config.rendezvous.variable_name.as_str();
        scope.set(name, id.to_vec());

        if peers.is_empty() {
            tracing::info!("no peers to broadcast to");
            return Ok(id);
        }

        let outcome = self.push_to_peers(peers, name, &id).await;
        for peer in peers {
            self.client.release(peer).await;
        }
        outcome.map(|()| id)
    }

    /// Runs both waves: the identifier to every peer, then the completion
    /// signal to every peer.
    async fn push_to_peers(&self, peers: &[String], name: &str, id: &UniqueId) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();
        let budget = self
            .config
            .timeouts
            .broadcast_timeout()
            .map(|limit| (Instant::now() + limit, limit));
        tracing::debug!(session = %session_id, peers = peers.len(), "broadcasting identifier");

        // Every peer must hold the identifier before anyone is signaled.
        let sends = peers.iter().map(|peer| {
            let message = VariableMessage {
                session_id: session_id.clone(),
                sender_rank: 0,
                name: name.to_string(),
                payload: id.to_vec(),
            };
            async move {
                let ack = self.client.send_variable(peer, message).await?;
                if ack.payload_len != UNIQUE_ID_BYTES as u64 {
                    return Err(RendezvousError::transport(
                        peer,
                        format!(
                            "peer stored {} bytes, expected {}",
                            ack.payload_len, UNIQUE_ID_BYTES
                        ),
                    ));
                }
                Ok(())
            }
        });
        within(budget, "sending the identifier to peers", try_join_all(sends)).await?;
        tracing::debug!(session = %session_id, "identifier acknowledged by all peers");

        let signals = peers.iter().map(|peer| {
            let signal = CompletionSignal {
                session_id: session_id.clone(),
                sender_rank: 0,
            };
            async move {
                let ack = self.client.send_completion_signal(peer, signal).await?;
                if !ack.has_variable(name) {
                    return Err(RendezvousError::transport(
                        peer,
                        format!(
                            "peer completed without '{}', holds {:?}",
                            name, ack.received_variables
                        ),
                    ));
                }
                Ok(())
            }
        });
        within(budget, "signaling batch completion", try_join_all(signals)).await?;

        Ok(())
    }

    async fn receive(&self, scope: &LocalScope, endpoint: &str) -> Result<UniqueId> {
        let name = self.config.rendezvous.variable_name.as_str();
        let mut progress = ReceiveProgress::new(endpoint);
        let barrier = Arc::new(BarrierMonitor::new());

        progress.advance(ReceivePhase::ServerStarting);
        let mut server = EphemeralEndpoint::new(endpoint, self.config.server.clone());
        server
            .register_variable_handler(Arc::new(ScopeVariableHandler::new(scope.handle(), name)))
            .register_completion_handler(Arc::new(BarrierCompletionHandler::new(
                barrier.clone(),
                scope.handle(),
            )));
        barrier.reset(1, BarrierKind::Receive)?;

        if let Err(e) = server.start().await {
            barrier.stop();
            progress.advance(ReceivePhase::Done);
            return Err(e);
        }

        progress.advance(ReceivePhase::WaitingForSignal);
        let waited = barrier.wait(self.config.timeouts.receive_timeout()).await;
        if matches!(waited, Ok(BarrierRelease::Signaled)) {
            progress.advance(ReceivePhase::Signaled);
        }

        progress.advance(ReceivePhase::ShuttingDown);
        barrier.stop();
        let stopped = server.shutdown().await;
        progress.advance(ReceivePhase::Done);

        if waited? == BarrierRelease::Stopped {
            return Err(RendezvousError::state(
                ReceivePhase::WaitingForSignal,
                "barrier stopped before the completion signal arrived",
            ));
        }
        stopped?;

        let bytes = scope
            .get(name)
            .ok_or_else(|| RendezvousError::variable_not_found(name))?;
        UniqueId::from_bytes(&bytes)
    }
}

/// Awaits `fut` against an optional shared deadline.
async fn within<T, F>(budget: Option<(Instant, Duration)>, stage: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match budget {
        Some((deadline, limit)) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| RendezvousError::timeout(stage, limit))?,
        None => fut.await,
    }
}
