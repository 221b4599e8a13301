// rust/rendezvous-core/src/identifier.rs

//! Collective-communication unique identifiers.
//!
//! A [`UniqueId`] is the opaque token every rank needs before it can join an
//! NCCL communicator. This crate never interprets the bytes; it only moves
//! them from rank 0 to the other ranks.

use std::fmt;

use rand::RngCore;

use crate::error::{RendezvousError, Result};

/// Size of `ncclUniqueId`.
pub const UNIQUE_ID_BYTES: usize = 128;

/// Fixed-size identifier shared by every rank of a collective group.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UniqueId([u8; UNIQUE_ID_BYTES]);

impl UniqueId {
    pub fn from_array(bytes: [u8; UNIQUE_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Copies an identifier out of a received payload.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::InvalidIdentifier`] if `bytes` is not
    /// exactly [`UNIQUE_ID_BYTES`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; UNIQUE_ID_BYTES] = bytes
            .try_into()
            .map_err(|_| RendezvousError::invalid_identifier(UNIQUE_ID_BYTES, bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Lowercase hex encoding of all bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for UniqueId {
    // Only a prefix; the full id is 256 hex characters.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueId({}..)", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for UniqueId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Source of fresh identifiers on rank 0.
pub trait IdGenerator: Send + Sync {
    /// Generate a new identifier.
    fn generate(&self) -> Result<UniqueId>;
}

/// Generates identifiers from the thread-local CSPRNG.
///
/// Suitable wherever the consumer only needs the ranks to agree on the
/// same bytes, e.g. CPU-only jobs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> Result<UniqueId> {
        let mut bytes = [0u8; UNIQUE_ID_BYTES];
        rand::thread_rng()
            .try_fill_bytes(&mut bytes)
            .map_err(|e| RendezvousError::generation_with_source("random source failed", e))?;
        Ok(UniqueId(bytes))
    }
}

/// Always hands out the same identifier.
#[derive(Debug, Clone)]
pub struct FixedIdGenerator {
    id: UniqueId,
}

impl FixedIdGenerator {
    pub fn new(id: UniqueId) -> Self {
        Self { id }
    }
}

impl IdGenerator for FixedIdGenerator {
    fn generate(&self) -> Result<UniqueId> {
        Ok(self.id)
    }
}

#[cfg(feature = "nccl")]
pub use nccl::NcclIdGenerator;

#[cfg(feature = "nccl")]
mod nccl {
    use std::mem::MaybeUninit;

    use cudarc::nccl::sys::{ncclGetUniqueId, ncclResult_t, ncclUniqueId};

    use super::{IdGenerator, UniqueId, UNIQUE_ID_BYTES};
    use crate::error::{RendezvousError, Result};

    /// Generates identifiers with `ncclGetUniqueId`.
    ///
    /// A failure here means the local driver or network setup is broken,
    /// so it is reported once and never retried.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NcclIdGenerator;

    impl IdGenerator for NcclIdGenerator {
        fn generate(&self) -> Result<UniqueId> {
            let mut nccl_id = MaybeUninit::<ncclUniqueId>::uninit();

            // SAFETY: ncclGetUniqueId initializes the ncclUniqueId struct
            let result = unsafe { ncclGetUniqueId(nccl_id.as_mut_ptr()) };
            if result != ncclResult_t::ncclSuccess {
                return Err(RendezvousError::generation(format!(
                    "ncclGetUniqueId failed: {:?}",
                    result
                )));
            }

            // SAFETY: ncclGetUniqueId succeeded and initialized the struct
            let nccl_id = unsafe { nccl_id.assume_init() };

            let mut bytes = [0u8; UNIQUE_ID_BYTES];
            for (dst, &src) in bytes.iter_mut().zip(nccl_id.internal.iter()) {
                *dst = src as u8;
            }
            Ok(UniqueId::from_array(bytes))
        }
    }
}

/// The generator used when none is injected.
pub fn default_generator() -> std::sync::Arc<dyn IdGenerator> {
    #[cfg(feature = "nccl")]
    {
        std::sync::Arc::new(NcclIdGenerator)
    }

    #[cfg(not(feature = "nccl"))]
    {
        std::sync::Arc::new(RandomIdGenerator)
    }
}
