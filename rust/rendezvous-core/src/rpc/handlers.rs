//! Request handlers registered on the ephemeral endpoint.

use std::sync::Arc;

use crate::barrier::BarrierMonitor;
use crate::error::{RendezvousError, Result};
use crate::identifier::UNIQUE_ID_BYTES;
use crate::scope::Scope;

use super::protocol::{CompletionAck, CompletionSignal, VariableAck, VariableMessage};

/// Handles `SendVariable` requests.
pub trait VariableHandler: Send + Sync {
    fn handle_variable(&self, message: VariableMessage) -> Result<VariableAck>;
}

/// Handles `SendCompletionSignal` requests.
pub trait CompletionHandler: Send + Sync {
    fn handle_completion(&self, signal: CompletionSignal) -> Result<CompletionAck>;
}

/// Writes the received identifier into a scope.
///
/// Only the agreed variable name is accepted, and only with an
/// identifier-sized payload.
pub struct ScopeVariableHandler {
    scope: Arc<Scope>,
    variable_name: String,
}

impl ScopeVariableHandler {
    pub fn new(scope: Arc<Scope>, variable_name: impl Into<String>) -> Self {
        Self {
            scope,
            variable_name: variable_name.into(),
        }
    }
}

impl VariableHandler for ScopeVariableHandler {
    fn handle_variable(&self, message: VariableMessage) -> Result<VariableAck> {
        if message.name != self.variable_name {
            return Err(RendezvousError::config(format!(
                "unexpected variable '{}', expected '{}'",
                message.name, self.variable_name
            )));
        }
        if message.payload.len() != UNIQUE_ID_BYTES {
            return Err(RendezvousError::invalid_identifier(
                UNIQUE_ID_BYTES,
                message.payload.len(),
            ));
        }

        let payload_len = message.payload.len() as u64;
        self.scope.set(message.name, message.payload);
        Ok(VariableAck { payload_len })
    }
}

/// Signals the barrier when the batch is complete.
pub struct BarrierCompletionHandler {
    barrier: Arc<BarrierMonitor>,
    scope: Arc<Scope>,
}

impl BarrierCompletionHandler {
    pub fn new(barrier: Arc<BarrierMonitor>, scope: Arc<Scope>) -> Self {
        Self { barrier, scope }
    }
}

impl CompletionHandler for BarrierCompletionHandler {
    fn handle_completion(&self, _signal: CompletionSignal) -> Result<CompletionAck> {
        // Snapshot before signaling: the waiter may tear the scope down
        // as soon as it is released.
        let received_variables = self.scope.var_names();
        self.barrier.signal()?;
        Ok(CompletionAck { received_variables })
    }
}
