//! Point-to-point RPC between rank 0 and its peers.
//!
//! Two unary calls make up the wire protocol:
//!
//! - `SendVariable` pushes one named variable into the peer's scope
//! - `SendCompletionSignal` tells the peer the batch is complete
//!
//! Rank 0 drives both through an [`RpcClient`]; peers answer them from an
//! [`EphemeralEndpoint`] that only lives for a single rendezvous.

mod client;
mod handlers;
pub mod protocol;
mod server;

// Include generated protobuf code
pub mod proto {
    tonic::include_proto!("nccl.rendezvous");
}

// Re-exports
pub use client::{GrpcRpcClient, RpcClient};
pub use handlers::{
    BarrierCompletionHandler, CompletionHandler, ScopeVariableHandler, VariableHandler,
};
pub use protocol::{CompletionAck, CompletionSignal, VariableAck, VariableMessage};
pub use server::EphemeralEndpoint;
