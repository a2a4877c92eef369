#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # sds-negotiation
//!
//! `sds-negotiation` decides, per connection, how an RPC data plane's
//! transport is secured: TLS material is resolved dynamically from a
//! secret-discovery control plane, and the connection's stage chain is
//! rewritten once the material arrives.
//!
//! A connection is modelled as a [`Pipeline`] of [`Stage`]s between the
//! transport and the application. Clients install a
//! [`ClientNegotiationHandler`]; servers install a [`HandlerPicker`].
//! Both resolve their connection's TLS context to a
//! [`TlsContextDescriptor`], obtain a shared [`SecretProvider`] from
//! the [`SecretProviderCache`] and, while delivery is pending, hold
//! early reads in a buffer. On delivery the handler swaps itself for a
//! TLS stage and replays the buffered bytes through it; connections
//! whose context names no TLS configuration carry traffic in the
//! clear, reported through the same
//! [`NegotiationComplete`](pipeline::ConnectionEvent::NegotiationComplete)
//! event.
//!
//! The TLS stage is sans-IO: ciphertext enters and leaves through the
//! pipeline, so the engine works with any transport the caller drives.
//!
//! ## Feature flags
//!
//! Exactly **one** `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`
//!
//! Enabling more than one provider results in a compile-time error.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sds_negotiation::{
//!     ClientNegotiationHandler, ConnectionMetadata, Pipeline, SecretProviderCache,
//!     UpstreamTlsContext,
//! };
//!
//! # fn descriptor() -> sds_negotiation::TlsContextDescriptor { unimplemented!() }
//! # async fn run() {
//! let cache = SecretProviderCache::new(tokio::runtime::Handle::current());
//!
//! let metadata = ConnectionMetadata {
//!     upstream_context: Some(UpstreamTlsContext::new(descriptor())),
//!     authority: Some("backend.internal".to_string()),
//!     ..ConnectionMetadata::default()
//! };
//! let mut pipeline = Pipeline::new(metadata);
//! pipeline.add_last("negotiation", ClientNegotiationHandler::new(cache));
//!
//! // Feed transport reads with `pipeline.fire_read`, drain
//! // `pipeline.take_outbound` to the socket, and drive deliveries with
//! // `pipeline.await_scheduled`.
//! # }
//! ```

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

mod crypto;
mod error;
mod observability;
mod prelude;

mod cache;
mod context;
mod material;
mod provider;
mod tls_stage;

pub mod negotiate;
pub mod pipeline;

// Public re-exports
pub use cache::{ProviderHandle, SecretProviderCache};
pub use context::{
    CertSource, ConnectionMetadata, DiscoverySource, DownstreamTlsContext, TlsContextDescriptor,
    UpstreamTlsContext,
};
pub use error::{Error, Result};
pub use material::{client_config, from_pem, server_config, TlsKey, TlsMaterial};
pub use negotiate::{
    ClientNegotiationHandler, DownstreamContextResolver, FallbackNegotiator, HandlerPicker,
    NegotiationState, NegotiationStateProbe, PlaintextFallback, StaticContextResolver,
};
pub use pipeline::{ConnectionEvent, ConnectionExecutor, Pipeline, Stage, StageContext};
pub use provider::{BoxFuture, SecretCallback, SecretFetcher, SecretProvider};
pub use tls_stage::TlsStage;
