// rust/rendezvous-core/src/lib.rs

//! NCCL Identifier Rendezvous - Core Library
//!
//! Rank 0 generates a collective-communication unique identifier and pushes
//! it to every peer over gRPC. Each peer runs a single-use endpoint that
//! stores the identifier and parks on a barrier until rank 0 signals that
//! the batch is complete.
//!
//! # Example
//!
//! ```no_run
//! use rendezvous_core::{RendezvousConfig, RendezvousCoordinator, RendezvousRequest};
//!
//! # async fn example() -> rendezvous_core::Result<()> {
//! let coordinator = RendezvousCoordinator::new(RendezvousConfig::default())?;
//! let request = RendezvousRequest {
//!     rank: 0,
//!     endpoint: String::new(),
//!     other_endpoints: vec!["node1:29500".to_string(), "node2:29500".to_string()],
//! };
//! let id = coordinator.run(&request).await?;
//! println!("{}", id.to_hex());
//! # Ok(())
//! # }
//! ```

pub mod barrier;
pub mod config;
pub mod error;
pub mod identifier;
pub mod retry;
pub mod rpc;
pub mod scope;

// Re-export commonly used types for convenience
pub use config::RendezvousConfig;
pub use error::{RendezvousError, Result};

pub use barrier::{BarrierKind, BarrierMonitor, BarrierPhase, BarrierRelease, BarrierState};
pub use identifier::{
    default_generator, FixedIdGenerator, IdGenerator, RandomIdGenerator, UniqueId,
    UNIQUE_ID_BYTES,
};
pub use scope::{LocalScope, Scope};

#[cfg(feature = "nccl")]
pub use identifier::NcclIdGenerator;

pub mod coordinator;
pub use coordinator::{ReceivePhase, RendezvousCoordinator, RendezvousRequest};
