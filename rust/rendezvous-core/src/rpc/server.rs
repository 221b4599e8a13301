//! Single-use gRPC endpoint a peer runs for the duration of one rendezvous.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use super::handlers::{CompletionHandler, VariableHandler};
use super::proto::rendezvous_service_server::{RendezvousService, RendezvousServiceServer};
use super::proto::{
    CompletionSignalRequest, CompletionSignalResponse, SendVariableRequest, SendVariableResponse,
};
use super::protocol::{CompletionSignal, VariableMessage};
use crate::config::{parse_endpoint, ServerConfig};
use crate::error::{RendezvousError, Result};

type ServeHandle = JoinHandle<std::result::Result<(), tonic::transport::Error>>;

struct RendezvousServiceImpl {
    variable_handler: Option<Arc<dyn VariableHandler>>,
    completion_handler: Option<Arc<dyn CompletionHandler>>,
    // First session seen wins; requests from any other session are refused.
    session: Mutex<Option<String>>,
}

impl RendezvousServiceImpl {
    fn accept_session(&self, session_id: &str) -> std::result::Result<(), Status> {
        let mut pinned = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match pinned.as_deref() {
            None => {
                *pinned = Some(session_id.to_string());
                Ok(())
            }
            Some(current) if current == session_id => Ok(()),
            Some(current) => Err(Status::failed_precondition(format!(
                "session '{}' does not match active session '{}'",
                session_id, current
            ))),
        }
    }
}

fn to_status(err: RendezvousError) -> Status {
    match err {
        RendezvousError::State { .. } => Status::failed_precondition(err.to_string()),
        RendezvousError::InvalidIdentifier { .. } | RendezvousError::Config { .. } => {
            Status::invalid_argument(err.to_string())
        }
        RendezvousError::Transport { .. } => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl RendezvousService for RendezvousServiceImpl {
    async fn send_variable(
        &self,
        request: Request<SendVariableRequest>,
    ) -> std::result::Result<Response<SendVariableResponse>, Status> {
        let handler = self
            .variable_handler
            .as_ref()
            .ok_or_else(|| Status::unimplemented("no handler registered for SendVariable"))?;

        let message = VariableMessage::from(request.into_inner());
        self.accept_session(&message.session_id)?;
        tracing::debug!(
            sender_rank = message.sender_rank,
            variable = %message.name,
            bytes = message.payload.len(),
            "variable received"
        );

        let ack = handler.handle_variable(message).map_err(to_status)?;
        Ok(Response::new(ack.into()))
    }

    async fn send_completion_signal(
        &self,
        request: Request<CompletionSignalRequest>,
    ) -> std::result::Result<Response<CompletionSignalResponse>, Status> {
        let handler = self.completion_handler.as_ref().ok_or_else(|| {
            Status::unimplemented("no handler registered for SendCompletionSignal")
        })?;

        let signal = CompletionSignal::from(request.into_inner());
        self.accept_session(&signal.session_id)?;
        tracing::debug!(sender_rank = signal.sender_rank, "completion signal received");

        let ack = handler.handle_completion(signal).map_err(to_status)?;
        Ok(Response::new(ack.into()))
    }
}

/// A listen-once RPC endpoint.
///
/// Handlers are registered before [`start`](Self::start). The socket is
/// bound with `SO_REUSEADDR` so the same address can be reused by the next
/// rendezvous right after [`shutdown`](Self::shutdown). Dropping a running
/// endpoint closes the shutdown channel, which also stops the server.
pub struct EphemeralEndpoint {
    endpoint: String,
    config: ServerConfig,
    variable_handler: Option<Arc<dyn VariableHandler>>,
    completion_handler: Option<Arc<dyn CompletionHandler>>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<ServeHandle>,
}

impl EphemeralEndpoint {
    pub fn new(endpoint: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            variable_handler: None,
            completion_handler: None,
            local_addr: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn register_variable_handler(&mut self, handler: Arc<dyn VariableHandler>) -> &mut Self {
        self.variable_handler = Some(handler);
        self
    }

    pub fn register_completion_handler(
        &mut self,
        handler: Arc<dyn CompletionHandler>,
    ) -> &mut Self {
        self.completion_handler = Some(handler);
        self
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Binds the socket and starts serving in a background task.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::Config`] for a malformed endpoint and
    /// [`RendezvousError::Transport`] if the address cannot be bound or the
    /// endpoint was already started.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.task.is_some() {
            return Err(RendezvousError::transport(
                &self.endpoint,
                "endpoint already started",
            ));
        }

        let listener = self.bind().await?;
        let local_addr = listener.local_addr().map_err(|e| {
            RendezvousError::transport_with_source(&self.endpoint, "failed to read local address", e)
        })?;

        let service = RendezvousServiceImpl {
            variable_handler: self.variable_handler.clone(),
            completion_handler: self.completion_handler.clone(),
            session: Mutex::new(None),
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let incoming = TcpListenerStream::new(listener);
        let task = tokio::spawn(async move {
            Server::builder()
                .add_service(RendezvousServiceServer::new(service))
                .serve_with_incoming_shutdown(incoming, async move {
                    // A dropped sender also counts as a shutdown request
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);

        tracing::info!(endpoint = %self.endpoint, %local_addr, "rendezvous endpoint listening");
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<TcpListener> {
        parse_endpoint(&self.endpoint)?;

        let addr = tokio::net::lookup_host(self.endpoint.as_str())
            .await
            .map_err(|e| {
                RendezvousError::transport_with_source(&self.endpoint, "failed to resolve", e)
            })?
            .next()
            .ok_or_else(|| RendezvousError::transport(&self.endpoint, "resolved to no address"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| {
            RendezvousError::transport_with_source(&self.endpoint, "failed to create socket", e)
        })?;

        socket.set_reuseaddr(true).map_err(|e| {
            RendezvousError::transport_with_source(&self.endpoint, "failed to set SO_REUSEADDR", e)
        })?;
        socket.bind(addr).map_err(|e| {
            RendezvousError::transport_with_source(
                &self.endpoint,
                format!("failed to bind {}", addr),
                e,
            )
        })?;
        socket.listen(self.config.backlog).map_err(|e| {
            RendezvousError::transport_with_source(&self.endpoint, "failed to listen", e)
        })
    }

    /// Stops accepting, drains open requests, and frees the port.
    ///
    /// Connections still open after the grace period are aborted. Calling
    /// this on a stopped or never-started endpoint is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        let grace = self.config.shutdown_grace();
        let joined = match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(endpoint = %self.endpoint, ?grace, "connections still open after grace period, aborting");
                task.abort();
                task.await
            }
        };

        let outcome = match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RendezvousError::transport_with_source(
                &self.endpoint,
                "server terminated with an error",
                e,
            )),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(RendezvousError::transport_with_source(
                &self.endpoint,
                "server task panicked",
                e,
            )),
        };

        tracing::info!(endpoint = %self.endpoint, "rendezvous endpoint stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{BarrierKind, BarrierMonitor, BarrierPhase};
    use crate::identifier::UNIQUE_ID_BYTES;
    use crate::rpc::handlers::{BarrierCompletionHandler, ScopeVariableHandler};
    use crate::rpc::proto::rendezvous_service_client::RendezvousServiceClient;
    use crate::scope::Scope;
    use tonic::Code;

    async fn client_for(addr: SocketAddr) -> RendezvousServiceClient<tonic::transport::Channel> {
        RendezvousServiceClient::connect(format!("http://{}", addr))
            .await
            .unwrap()
    }

    fn variable(session: &str) -> SendVariableRequest {
        SendVariableRequest {
            session_id: session.to_string(),
            sender_rank: 0,
            variable_name: "NCCLID".to_string(),
            payload: vec![7; UNIQUE_ID_BYTES],
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut endpoint = EphemeralEndpoint::new("127.0.0.1:0", ServerConfig::default());
        assert!(endpoint.local_addr().is_none());

        let addr = endpoint.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(endpoint.is_running());
        assert!(endpoint.start().await.is_err());

        endpoint.shutdown().await.unwrap();
        assert!(!endpoint.is_running());

        // Second shutdown is a no-op
        endpoint.shutdown().await.unwrap();

        // The port is free again
        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let mut endpoint = EphemeralEndpoint::new("no-port", ServerConfig::default());
        let result = endpoint.start().await;
        assert!(matches!(result, Err(RendezvousError::Config { .. })));
    }

    #[tokio::test]
    async fn test_handlers_receive_requests() {
        let scope = Scope::new_root();
        let barrier = Arc::new(BarrierMonitor::new());
        barrier.reset(1, BarrierKind::Receive).unwrap();

        let mut endpoint = EphemeralEndpoint::new("127.0.0.1:0", ServerConfig::default());
        endpoint
            .register_variable_handler(Arc::new(ScopeVariableHandler::new(scope.clone(), "NCCLID")))
            .register_completion_handler(Arc::new(BarrierCompletionHandler::new(
                barrier.clone(),
                scope.clone(),
            )));
        let addr = endpoint.start().await.unwrap();

        let mut client = client_for(addr).await;
        let ack = client.send_variable(variable("s-1")).await.unwrap();
        assert_eq!(ack.into_inner().payload_len, UNIQUE_ID_BYTES as u64);

        let ack = client
            .send_completion_signal(CompletionSignalRequest {
                session_id: "s-1".to_string(),
                sender_rank: 0,
            })
            .await
            .unwrap();
        assert_eq!(ack.into_inner().received_variables, vec!["NCCLID".to_string()]);
        assert_eq!(barrier.phase(), BarrierPhase::Signaled);
        assert_eq!(scope.get("NCCLID"), Some(vec![7; UNIQUE_ID_BYTES]));

        endpoint.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_mismatch_rejected() {
        let scope = Scope::new_root();
        let mut endpoint = EphemeralEndpoint::new("127.0.0.1:0", ServerConfig::default());
        endpoint
            .register_variable_handler(Arc::new(ScopeVariableHandler::new(scope, "NCCLID")));
        let addr = endpoint.start().await.unwrap();

        let mut client = client_for(addr).await;
        client.send_variable(variable("first")).await.unwrap();

        let status = client.send_variable(variable("second")).await.unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);

        endpoint.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_payload_is_invalid_argument() {
        let scope = Scope::new_root();
        let mut endpoint = EphemeralEndpoint::new("127.0.0.1:0", ServerConfig::default());
        endpoint
            .register_variable_handler(Arc::new(ScopeVariableHandler::new(scope, "NCCLID")));
        let addr = endpoint.start().await.unwrap();

        let mut client = client_for(addr).await;
        let mut request = variable("s");
        request.payload.truncate(10);
        let status = client.send_variable(request).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        endpoint.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_handler_is_unimplemented() {
        let mut endpoint = EphemeralEndpoint::new("127.0.0.1:0", ServerConfig::default());
        let addr = endpoint.start().await.unwrap();

        let mut client = client_for(addr).await;
        let status = client
            .send_completion_signal(CompletionSignalRequest {
                session_id: "s".to_string(),
                sender_rank: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);

        endpoint.shutdown().await.unwrap();
    }
}
