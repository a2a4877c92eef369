//! Per-connection secure-channel negotiation.
//!
//! The client side installs a [`ClientNegotiationHandler`] at pipeline
//! setup; the server side installs a [`HandlerPicker`], which waits for
//! [`ConnectionEvent::Established`](crate::pipeline::ConnectionEvent)
//! before deciding how the connection negotiates. Both end up either
//! installing a [`TlsStage`](crate::tls_stage::TlsStage) built from
//! delivered material, falling back to plaintext, or failing the
//! connection.

mod client;
mod server;

pub use client::ClientNegotiationHandler;
pub use server::{DownstreamContextResolver, HandlerPicker, ServerNegotiationHandler, StaticContextResolver};

use std::sync::{Arc, Mutex, PoisonError};

use crate::pipeline::{ConnectionEvent, Stage, StageContext};

/// Name under which negotiation handlers are conventionally installed.
pub const NEGOTIATION_STAGE: &str = "negotiation";

/// Name of the temporary read buffer installed during negotiation.
pub const BUFFER_STAGE: &str = "negotiation-buffer";

/// Name of the TLS stage installed on success.
pub const TLS_STAGE: &str = "tls";

/// Name of the stage installed when a connection proceeds in the clear.
pub const PLAINTEXT_STAGE: &str = "plaintext";

/// Where one connection's negotiation currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    /// The handler has not been added to a pipeline yet.
    Init,

    /// A provider was obtained and secret delivery is pending.
    AwaitingSecret,

    /// TLS material arrived and the TLS stage is in the pipeline.
    Installed,

    /// The connection proceeds without TLS.
    FellBack,

    /// Negotiation failed; the pipeline carries no further data.
    Failed,
}

#[derive(Clone)]
pub(crate) struct StateCell(Arc<Mutex<NegotiationState>>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(NegotiationState::Init)))
    }

    pub(crate) fn set(&self, state: NegotiationState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn get(&self) -> NegotiationState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateCell({:?})", self.get())
    }
}

/// Read-only view of a handler's [`NegotiationState`], for callers that
/// need to observe the outcome (health checks, tests).
#[derive(Clone, Debug)]
pub struct NegotiationStateProbe(pub(crate) StateCell);

impl NegotiationStateProbe {
    /// The current state.
    pub fn state(&self) -> NegotiationState {
        self.0.get()
    }
}

/// Builds the stage a connection runs when it negotiates no TLS.
pub trait FallbackNegotiator: Send + Sync {
    /// A fresh stage for one connection.
    fn stage(&self) -> Box<dyn Stage>;
}

impl std::fmt::Debug for dyn FallbackNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FallbackNegotiator")
    }
}

/// Fallback that carries traffic in the clear and reports negotiation
/// as complete immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaintextFallback;

impl FallbackNegotiator for PlaintextFallback {
    fn stage(&self) -> Box<dyn Stage> {
        Box::new(PlaintextStage)
    }
}

/// Pass-through stage marking a connection that negotiated plaintext.
#[derive(Debug)]
pub(crate) struct PlaintextStage;

impl Stage for PlaintextStage {
    fn on_added(&mut self, ctx: &mut StageContext<'_>) {
        ctx.forward_event(ConnectionEvent::NegotiationComplete);
    }
}
