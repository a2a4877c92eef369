//! Client-side negotiation handler.

use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::{ProviderHandle, SecretProviderCache};
use crate::error::Error;
use crate::material;
use crate::negotiate::{
    NegotiationState, NegotiationStateProbe, PlaintextStage, StateCell, BUFFER_STAGE,
    PLAINTEXT_STAGE, TLS_STAGE,
};
use crate::pipeline::{BufferReads, ConnectionEvent, Stage, StageContext};
use crate::prelude::{debug, info};
use crate::provider::SecretCallback;
use crate::tls_stage::TlsStage;

type HandleCell = Arc<Mutex<Option<ProviderHandle>>>;

/// Negotiates the client side of a connection.
///
/// Added to the pipeline at connection setup. If the connection's
/// upstream context names no TLS configuration the handler steps aside
/// for plaintext immediately. Otherwise it buffers reads, asks the
/// cache for the context's provider and, once material is delivered,
/// swaps itself for a [`TlsStage`] and replays what was buffered.
///
/// Any failure on the client side is fatal to the connection; there is
/// no client fallback.
#[derive(Debug)]
pub struct ClientNegotiationHandler {
    cache: SecretProviderCache,
    state: StateCell,
    handle: HandleCell,
}

impl ClientNegotiationHandler {
    /// A handler drawing providers from `cache`.
    pub fn new(cache: SecretProviderCache) -> Self {
        Self {
            cache,
            state: StateCell::new(),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// A probe observing this handler's negotiation state.
    pub fn probe(&self) -> NegotiationStateProbe {
        NegotiationStateProbe(self.state.clone())
    }
}

impl Drop for ClientNegotiationHandler {
    // A connection torn down while awaiting delivery still holds its
    // provider reference in the shared cell; the delivery closures
    // empty the cell before this runs, so the release happens exactly
    // once either way.
    fn drop(&mut self) {
        release(&self.handle);
    }
}

impl Stage for ClientNegotiationHandler {
    fn on_added(&mut self, ctx: &mut StageContext<'_>) {
        let descriptor = ctx
            .metadata()
            .upstream_context
            .clone()
            .and_then(|c| c.into_descriptor());

        let Some(descriptor) = descriptor else {
            info!("no upstream TLS context, proceeding in the clear");
            self.state.set(NegotiationState::FellBack);
            ctx.replace_self(PLAINTEXT_STAGE, PlaintextStage);
            return;
        };

        let handle = match self.cache.find_or_create(&descriptor) {
            Ok(handle) => handle,
            Err(err) => {
                self.state.set(NegotiationState::Failed);
                ctx.forward_error(err);
                return;
            }
        };

        ctx.insert_before_self(BUFFER_STAGE, BufferReads::new());
        self.state.set(NegotiationState::AwaitingSecret);
        debug!("client negotiation awaiting secret delivery");

        let me = ctx.name().to_string();
        let state = self.state.clone();
        let handle_cell = Arc::clone(&self.handle);
        *handle_cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let callback = SecretCallback::new(
            ctx.executor(),
            {
                let me = me.clone();
                let state = state.clone();
                let handle_cell = Arc::clone(&handle_cell);
                move |pipeline, delivered| {
                    let built = pipeline
                        .metadata()
                        .authority
                        .clone()
                        .ok_or_else(|| {
                            Error::HandshakeFailed(
                                "connection has no authority to verify against".to_string(),
                            )
                        })
                        .and_then(|authority| {
                            let config = Arc::new(material::client_config(&delivered)?);
                            TlsStage::client(config, &authority)
                        });

                    release(&handle_cell);
                    match built {
                        Ok(tls) => {
                            pipeline.insert_after(&me, TLS_STAGE, tls);
                            pipeline.remove(&me);
                            pipeline.remove(BUFFER_STAGE);
                            state.set(NegotiationState::Installed);
                            pipeline.fire_event(ConnectionEvent::NegotiationComplete);
                        }
                        Err(err) => {
                            state.set(NegotiationState::Failed);
                            pipeline.fire_error(err);
                        }
                    }
                }
            },
            move |pipeline, err| {
                release(&handle_cell);
                state.set(NegotiationState::Failed);
                pipeline.fire_error(err);
            },
        );

        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            handle.register(callback);
        }
    }
}

fn release(handle_cell: &HandleCell) {
    handle_cell
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{
        CertSource, ConnectionMetadata, TlsContextDescriptor, UpstreamTlsContext,
    };
    use crate::negotiate::NEGOTIATION_STAGE;
    use crate::pipeline::Pipeline;

    fn cache() -> SecretProviderCache {
        SecretProviderCache::new(tokio::runtime::Handle::current())
    }

    struct NeverFetcher;

    impl crate::provider::SecretFetcher for NeverFetcher {
        fn fetch(
            &self,
            _: &str,
            _: &crate::context::DiscoverySource,
        ) -> crate::provider::BoxFuture<'static, crate::error::Result<crate::material::TlsMaterial>>
        {
            Box::pin(std::future::pending())
        }
    }

    fn discovery_metadata() -> ConnectionMetadata {
        let descriptor = TlsContextDescriptor::new(CertSource::Discovery {
            secret_name: "client-cert".to_string(),
            source: crate::context::DiscoverySource {
                server_uri: "unix:///run/sds.sock".to_string(),
            },
        });
        ConnectionMetadata {
            upstream_context: Some(UpstreamTlsContext::new(descriptor)),
            authority: Some("localhost".to_string()),
            ..ConnectionMetadata::default()
        }
    }

    #[tokio::test]
    async fn empty_context_goes_plaintext_and_completes() {
        let metadata = ConnectionMetadata {
            upstream_context: Some(UpstreamTlsContext::empty()),
            ..ConnectionMetadata::default()
        };
        let mut pipeline = Pipeline::new(metadata);
        let handler = ClientNegotiationHandler::new(cache());
        let probe = handler.probe();

        pipeline.add_last(NEGOTIATION_STAGE, handler);

        assert_eq!(probe.state(), NegotiationState::FellBack);
        assert!(pipeline.negotiation_complete());
        assert_eq!(pipeline.stage_names(), vec![PLAINTEXT_STAGE]);
    }

    #[tokio::test]
    async fn malformed_static_context_fails_synchronously() {
        let descriptor = TlsContextDescriptor::new(CertSource::StaticPem {
            cert_chain_pem: None,
            private_key_pem: None,
            trust_roots_pem: Some("not pem".to_string()),
        });
        let metadata = ConnectionMetadata {
            upstream_context: Some(UpstreamTlsContext::new(descriptor)),
            authority: Some("localhost".to_string()),
            ..ConnectionMetadata::default()
        };
        let mut pipeline = Pipeline::new(metadata);
        let handler = ClientNegotiationHandler::new(cache());
        let probe = handler.probe();

        pipeline.add_last(NEGOTIATION_STAGE, handler);

        assert_eq!(probe.state(), NegotiationState::Failed);
        assert!(matches!(
            pipeline.error(),
            Some(Error::ProviderCreationFailed(_))
        ));
    }

    #[tokio::test]
    async fn reads_are_buffered_while_awaiting_the_secret() {
        let mut pipeline = Pipeline::new(discovery_metadata());
        let handler = ClientNegotiationHandler::new(SecretProviderCache::with_fetcher(
            tokio::runtime::Handle::current(),
            Arc::new(NeverFetcher),
        ));
        let probe = handler.probe();

        pipeline.add_last(NEGOTIATION_STAGE, handler);
        assert_eq!(probe.state(), NegotiationState::AwaitingSecret);
        assert_eq!(
            pipeline.stage_names(),
            vec![BUFFER_STAGE, NEGOTIATION_STAGE]
        );

        pipeline.fire_read(bytes::Bytes::from_static(b"early"));
        assert!(pipeline.take_inbound().is_empty());
    }

    #[tokio::test]
    async fn abandoned_connection_releases_its_provider() {
        let cache = SecretProviderCache::with_fetcher(
            tokio::runtime::Handle::current(),
            Arc::new(NeverFetcher),
        );
        let metadata = discovery_metadata();
        let descriptor = metadata
            .upstream_context
            .clone()
            .and_then(UpstreamTlsContext::into_descriptor)
            .expect("discovery descriptor");

        let mut pipeline = Pipeline::new(metadata);
        pipeline.add_last(NEGOTIATION_STAGE, ClientNegotiationHandler::new(cache.clone()));
        assert_eq!(cache.ref_count(&descriptor), 1);

        drop(pipeline);

        assert_eq!(cache.ref_count(&descriptor), 0);
        assert!(cache.is_empty());
    }
}
