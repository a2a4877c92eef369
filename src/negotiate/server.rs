//! Server-side negotiation: per-connection context resolution followed
//! by the negotiation handler proper.

use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::{ProviderHandle, SecretProviderCache};
use crate::context::{ConnectionMetadata, DownstreamTlsContext, TlsContextDescriptor};
use crate::error::Error;
use crate::material;
use crate::negotiate::{
    FallbackNegotiator, NegotiationState, NegotiationStateProbe, StateCell, BUFFER_STAGE,
    NEGOTIATION_STAGE, PLAINTEXT_STAGE, TLS_STAGE,
};
use crate::pipeline::{BufferReads, ConnectionEvent, Stage, StageContext};
use crate::prelude::{debug, info, warn};
use crate::provider::SecretCallback;
use crate::tls_stage::TlsStage;

/// Maps an accepted connection to its downstream TLS context.
///
/// Listener filter-chain matching lives behind this trait; the engine
/// only cares about the resolved context.
pub trait DownstreamContextResolver: Send + Sync {
    /// The context for this connection, or `None` when no filter
    /// matches it.
    fn resolve(&self, metadata: &ConnectionMetadata) -> Option<DownstreamTlsContext>;
}

impl std::fmt::Debug for dyn DownstreamContextResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DownstreamContextResolver")
    }
}

/// Resolver that hands every connection the same context.
#[derive(Clone, Debug)]
pub struct StaticContextResolver {
    context: Option<DownstreamTlsContext>,
}

impl StaticContextResolver {
    /// Resolves every connection to `context`.
    pub fn new(context: DownstreamTlsContext) -> Self {
        Self {
            context: Some(context),
        }
    }

    /// Resolves no connection; with a fallback configured this means
    /// every connection runs plaintext.
    pub fn none() -> Self {
        Self { context: None }
    }
}

impl DownstreamContextResolver for StaticContextResolver {
    fn resolve(&self, _metadata: &ConnectionMetadata) -> Option<DownstreamTlsContext> {
        self.context.clone()
    }
}

/// First stage a server installs on an accepted connection.
///
/// Waits for [`ConnectionEvent::Established`], resolves the
/// connection's downstream context and swaps itself for either a
/// [`ServerNegotiationHandler`] or, when no TLS is configured and a
/// fallback exists, the fallback's stage. No TLS and no fallback fails
/// the connection with [`Error::NoCertificateSource`].
pub struct HandlerPicker {
    cache: SecretProviderCache,
    resolver: Arc<dyn DownstreamContextResolver>,
    fallback: Option<Arc<dyn FallbackNegotiator>>,
    state: StateCell,
}

impl std::fmt::Debug for HandlerPicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerPicker")
            .field("state", &self.state)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl HandlerPicker {
    /// A picker with no fallback: connections without a TLS context
    /// fail.
    pub fn new(cache: SecretProviderCache, resolver: Arc<dyn DownstreamContextResolver>) -> Self {
        Self {
            cache,
            resolver,
            fallback: None,
            state: StateCell::new(),
        }
    }

    /// Configures how connections without a TLS context proceed.
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackNegotiator>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// A probe observing this connection's negotiation state.
    pub fn probe(&self) -> NegotiationStateProbe {
        NegotiationStateProbe(self.state.clone())
    }
}

impl Stage for HandlerPicker {
    fn on_event(&mut self, ctx: &mut StageContext<'_>, event: ConnectionEvent) {
        if event != ConnectionEvent::Established {
            ctx.forward_event(event);
            return;
        }
        ctx.forward_event(event);

        let descriptor = self
            .resolver
            .resolve(ctx.metadata())
            .and_then(|c| c.into_descriptor());

        match descriptor {
            Some(descriptor) => {
                debug!("downstream context resolved, starting negotiation");
                ctx.replace_self(
                    NEGOTIATION_STAGE,
                    ServerNegotiationHandler::new(
                        self.cache.clone(),
                        descriptor,
                        self.fallback.clone(),
                        self.state.clone(),
                    ),
                );
            }
            None => match &self.fallback {
                Some(fallback) => {
                    info!("no downstream TLS context, falling back");
                    self.state.set(NegotiationState::FellBack);
                    ctx.replace_self(PLAINTEXT_STAGE, fallback.stage());
                }
                None => {
                    warn!("no downstream TLS context and no fallback");
                    self.state.set(NegotiationState::Failed);
                    ctx.forward_error(Error::NoCertificateSource);
                }
            },
        }
    }
}

type HandleCell = Arc<Mutex<Option<ProviderHandle>>>;

/// Negotiates the server side of a connection once its context is
/// known.
///
/// Provider construction failure is still fallback-eligible: the
/// configuration never produced a provider, which is the same situation
/// as having no context. A failure *after* the provider was obtained,
/// delivered asynchronously, is always fatal.
pub struct ServerNegotiationHandler {
    cache: SecretProviderCache,
    descriptor: TlsContextDescriptor,
    fallback: Option<Arc<dyn FallbackNegotiator>>,
    state: StateCell,
    handle: HandleCell,
}

impl std::fmt::Debug for ServerNegotiationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerNegotiationHandler")
            .field("state", &self.state)
            .finish()
    }
}

impl ServerNegotiationHandler {
    pub(crate) fn new(
        cache: SecretProviderCache,
        descriptor: TlsContextDescriptor,
        fallback: Option<Arc<dyn FallbackNegotiator>>,
        state: StateCell,
    ) -> Self {
        Self {
            cache,
            descriptor,
            fallback,
            state,
            handle: Arc::new(Mutex::new(None)),
        }
    }
}

impl Drop for ServerNegotiationHandler {
    // Same teardown contract as the client handler: a connection
    // abandoned before delivery releases its provider reference here,
    // while the delivery closures empty the cell first on the normal
    // paths.
    fn drop(&mut self) {
        release(&self.handle);
    }
}

impl Stage for ServerNegotiationHandler {
    fn on_added(&mut self, ctx: &mut StageContext<'_>) {
        let handle = match self.cache.find_or_create(&self.descriptor) {
            Ok(handle) => handle,
            Err(err) => match &self.fallback {
                Some(fallback) => {
                    info!("provider construction failed ({err}), falling back");
                    self.state.set(NegotiationState::FellBack);
                    ctx.replace_self(PLAINTEXT_STAGE, fallback.stage());
                    return;
                }
                None => {
                    self.state.set(NegotiationState::Failed);
                    ctx.forward_error(err);
                    return;
                }
            },
        };

        ctx.insert_before_self(BUFFER_STAGE, BufferReads::new());
        self.state.set(NegotiationState::AwaitingSecret);
        debug!("server negotiation awaiting secret delivery");

        let me = ctx.name().to_string();
        let state = self.state.clone();
        let handle_cell = Arc::clone(&self.handle);
        *handle_cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let callback = SecretCallback::new(
            ctx.executor(),
            {
                let state = state.clone();
                let handle_cell = Arc::clone(&handle_cell);
                move |pipeline, delivered| {
                    release(&handle_cell);
                    let built =
                        material::server_config(&delivered).map(Arc::new).and_then(TlsStage::server);
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
    use crate::context::CertSource;
    use crate::negotiate::PlaintextFallback;
    use crate::pipeline::Pipeline;

    fn cache() -> SecretProviderCache {
        SecretProviderCache::new(tokio::runtime::Handle::current())
    }

    fn picker_pipeline(
        picker: HandlerPicker,
    ) -> (Pipeline, NegotiationStateProbe) {
        let probe = picker.probe();
        let mut pipeline = Pipeline::new(ConnectionMetadata::default());
        pipeline.add_last("picker", picker);
        (pipeline, probe)
    }

    fn malformed_descriptor() -> TlsContextDescriptor {
        TlsContextDescriptor::new(CertSource::StaticPem {
            cert_chain_pem: Some("not pem".to_string()),
            private_key_pem: None,
            trust_roots_pem: None,
        })
    }

    #[tokio::test]
    async fn no_context_with_fallback_goes_plaintext() {
        let picker = HandlerPicker::new(cache(), Arc::new(StaticContextResolver::none()))
            .with_fallback(Arc::new(PlaintextFallback));
        let (mut pipeline, probe) = picker_pipeline(picker);

        pipeline.fire_event(ConnectionEvent::Established);

        assert_eq!(probe.state(), NegotiationState::FellBack);
        assert!(pipeline.negotiation_complete());
        assert_eq!(pipeline.stage_names(), vec![PLAINTEXT_STAGE]);
    }

    #[tokio::test]
    async fn no_context_without_fallback_fails() {
        let picker = HandlerPicker::new(cache(), Arc::new(StaticContextResolver::none()));
        let (mut pipeline, probe) = picker_pipeline(picker);

        pipeline.fire_event(ConnectionEvent::Established);

        assert_eq!(probe.state(), NegotiationState::Failed);
        assert!(matches!(pipeline.error(), Some(Error::NoCertificateSource)));
    }

    #[tokio::test]
    async fn empty_resolved_context_counts_as_no_context() {
        let picker = HandlerPicker::new(
            cache(),
            Arc::new(StaticContextResolver::new(DownstreamTlsContext::empty())),
        )
        .with_fallback(Arc::new(PlaintextFallback));
        let (mut pipeline, probe) = picker_pipeline(picker);

        pipeline.fire_event(ConnectionEvent::Established);

        assert_eq!(probe.state(), NegotiationState::FellBack);
    }

    #[tokio::test]
    async fn provider_construction_failure_is_fallback_eligible() {
        let picker = HandlerPicker::new(
            cache(),
            Arc::new(StaticContextResolver::new(DownstreamTlsContext::new(
                malformed_descriptor(),
            ))),
        )
        .with_fallback(Arc::new(PlaintextFallback));
        let (mut pipeline, probe) = picker_pipeline(picker);

        pipeline.fire_event(ConnectionEvent::Established);

        assert_eq!(probe.state(), NegotiationState::FellBack);
        assert!(pipeline.negotiation_complete());
        assert!(pipeline.error().is_none());
    }

    #[tokio::test]
    async fn provider_construction_failure_without_fallback_is_fatal() {
        let picker = HandlerPicker::new(
            cache(),
            Arc::new(StaticContextResolver::new(DownstreamTlsContext::new(
                malformed_descriptor(),
            ))),
        );
        let (mut pipeline, probe) = picker_pipeline(picker);

        pipeline.fire_event(ConnectionEvent::Established);

        assert_eq!(probe.state(), NegotiationState::Failed);
        assert!(matches!(
            pipeline.error(),
            Some(Error::ProviderCreationFailed(_))
        ));
    }

    fn discovery_descriptor() -> TlsContextDescriptor {
        TlsContextDescriptor::new(CertSource::Discovery {
            secret_name: "server-cert".to_string(),
            source: crate::context::DiscoverySource {
                server_uri: "unix:///run/sds.sock".to_string(),
            },
        })
    }

    #[tokio::test]
    async fn abandoned_connection_releases_its_provider() {
        use crate::context::DiscoverySource;
        use crate::material::TlsMaterial;
        use crate::provider::{BoxFuture, SecretFetcher};

        struct NeverFetcher;
        impl SecretFetcher for NeverFetcher {
            fn fetch(
                &self,
                _: &str,
                _: &DiscoverySource,
            ) -> BoxFuture<'static, crate::error::Result<TlsMaterial>> {
                Box::pin(std::future::pending())
            }
        }

        let cache = SecretProviderCache::with_fetcher(
            tokio::runtime::Handle::current(),
            Arc::new(NeverFetcher),
        );
        let descriptor = discovery_descriptor();
        let picker = HandlerPicker::new(
            cache.clone(),
            Arc::new(StaticContextResolver::new(DownstreamTlsContext::new(
                descriptor.clone(),
            ))),
        );
        let (mut pipeline, probe) = picker_pipeline(picker);

        pipeline.fire_event(ConnectionEvent::Established);
        assert_eq!(probe.state(), NegotiationState::AwaitingSecret);
        assert_eq!(cache.ref_count(&descriptor), 1);

        drop(pipeline);

        assert_eq!(cache.ref_count(&descriptor), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn async_delivery_failure_is_fatal_even_with_fallback() {
        use crate::context::DiscoverySource;
        use crate::material::TlsMaterial;
        use crate::provider::{BoxFuture, SecretFetcher};

        struct FailingFetcher;
        impl SecretFetcher for FailingFetcher {
            fn fetch(
                &self,
                _: &str,
                _: &DiscoverySource,
            ) -> BoxFuture<'static, crate::error::Result<TlsMaterial>> {
                Box::pin(async {
                    Err(Error::SecretDeliveryFailed("control plane said no".to_string()))
                })
            }
        }

        let descriptor = TlsContextDescriptor::new(CertSource::Discovery {
            secret_name: "server-cert".to_string(),
            source: DiscoverySource {
                server_uri: "unix:///run/sds.sock".to_string(),
            },
        });
        let cache = SecretProviderCache::with_fetcher(
            tokio::runtime::Handle::current(),
            Arc::new(FailingFetcher),
        );
        let picker = HandlerPicker::new(
            cache,
            Arc::new(StaticContextResolver::new(DownstreamTlsContext::new(
                descriptor,
            ))),
        )
        .with_fallback(Arc::new(PlaintextFallback));
        let (mut pipeline, probe) = picker_pipeline(picker);

        pipeline.fire_event(ConnectionEvent::Established);
        assert_eq!(probe.state(), NegotiationState::AwaitingSecret);

        pipeline.await_scheduled().await;

        assert_eq!(probe.state(), NegotiationState::Failed);
        assert!(matches!(
            pipeline.error(),
            Some(Error::SecretDeliveryFailed(_))
        ));
    }
}
