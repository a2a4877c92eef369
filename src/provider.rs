//! Asynchronous delivery of TLS material to waiting connections.
//!
//! A [`SecretProvider`] represents one in-flight (or finished)
//! acquisition of [`TlsMaterial`] for a context descriptor. Connections
//! register a [`SecretCallback`]; the provider fires each callback
//! exactly once, on the connection's own executor, with either the
//! delivered material or a terminal error. Callbacks registered after
//! the provider reached a terminal state observe that same outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::context::DiscoverySource;
use crate::error::{Error, Result};
use crate::material::TlsMaterial;
use crate::pipeline::{ConnectionExecutor, Pipeline};
use crate::prelude::{debug, warn};

/// An owned, boxed future, as returned by [`SecretFetcher::fetch`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Resolves a named secret against a discovery source.
///
/// Implementations typically hold a client for the secret-discovery
/// control plane; tests substitute in-memory fetchers.
pub trait SecretFetcher: Send + Sync {
    /// Fetches TLS material for `secret_name` from `source`.
    fn fetch(&self, secret_name: &str, source: &DiscoverySource) -> BoxFuture<'static, Result<TlsMaterial>>;
}

impl std::fmt::Debug for dyn SecretFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretFetcher")
    }
}

type SuccessFn = Box<dyn FnOnce(&mut Pipeline, Arc<TlsMaterial>) + Send>;
type FailureFn = Box<dyn FnOnce(&mut Pipeline, Error) + Send>;

/// A one-shot pair of continuations for a single connection.
///
/// Whichever side fires, it runs on the connection's executor, so the
/// continuation gets exclusive access to the connection's pipeline.
pub struct SecretCallback {
    executor: ConnectionExecutor,
    on_success: SuccessFn,
    on_failure: FailureFn,
}

impl std::fmt::Debug for SecretCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCallback")
    }
}

impl SecretCallback {
    /// Pairs success and failure continuations with the executor of the
    /// connection that will consume the material.
    pub fn new<S, F>(executor: ConnectionExecutor, on_success: S, on_failure: F) -> Self
    where
        S: FnOnce(&mut Pipeline, Arc<TlsMaterial>) + Send + 'static,
        F: FnOnce(&mut Pipeline, Error) + Send + 'static,
    {
        Self {
            executor,
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }

    fn complete(self, outcome: Result<Arc<TlsMaterial>>) {
        let Self {
            executor,
            on_success,
            on_failure,
        } = self;
        let delivered = match outcome {
            Ok(material) => executor.execute(move |pipeline| on_success(pipeline, material)),
            Err(err) => executor.execute(move |pipeline| on_failure(pipeline, err)),
        };
        if !delivered {
            warn!("dropping secret callback: connection executor is gone");
        }
    }
}

enum DeliveryState {
    Pending(Vec<SecretCallback>),
    Delivered(Arc<TlsMaterial>),
    Failed(Error),
}

struct ProviderShared {
    state: Mutex<DeliveryState>,
    cancel: CancellationToken,
}

impl ProviderShared {
    fn resolve(&self, outcome: Result<Arc<TlsMaterial>>) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let pending = match &mut *state {
            DeliveryState::Pending(callbacks) => std::mem::take(callbacks),
            _ => {
                debug!("secret provider already terminal, ignoring late resolution");
                return;
            }
        };
        *state = match &outcome {
            Ok(material) => DeliveryState::Delivered(Arc::clone(material)),
            Err(err) => DeliveryState::Failed(err.clone()),
        };
        drop(state);

        debug!("resolving secret provider for {} waiter(s)", pending.len());
        for callback in pending {
            callback.complete(outcome.clone());
        }
    }
}

/// One acquisition of TLS material, shared by every connection whose
/// context descriptor maps to it.
pub struct SecretProvider {
    shared: Arc<ProviderShared>,
}

impl std::fmt::Debug for SecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let label = match &*state {
            DeliveryState::Pending(callbacks) => format!("pending({})", callbacks.len()),
            DeliveryState::Delivered(_) => "delivered".to_string(),
            DeliveryState::Failed(_) => "failed".to_string(),
        };
        f.debug_struct("SecretProvider").field("state", &label).finish()
    }
}

impl SecretProvider {
    fn with_state(state: DeliveryState) -> Self {
        Self {
            shared: Arc::new(ProviderShared {
                state: Mutex::new(state),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// A provider whose material was already at hand when it was built.
    pub fn ready(material: TlsMaterial) -> Self {
        Self::with_state(DeliveryState::Delivered(Arc::new(material)))
    }

    /// A provider that can only replay the given failure.
    pub fn failed(error: Error) -> Self {
        Self::with_state(DeliveryState::Failed(error))
    }

    /// Drives `acquire` on `runtime` and resolves the provider with its
    /// outcome. Acquisition errors are folded into
    /// [`Error::SecretDeliveryFailed`].
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        acquire: BoxFuture<'static, Result<TlsMaterial>>,
    ) -> Self {
        let provider = Self::with_state(DeliveryState::Pending(Vec::new()));
        let shared = Arc::clone(&provider.shared);
        runtime.spawn(async move {
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    shared.resolve(Err(Error::Closed));
                }
                outcome = acquire => {
                    let outcome = outcome
                        .map(Arc::new)
                        .map_err(|e| match e {
                            err @ Error::SecretDeliveryFailed(_) => err,
                            other => Error::SecretDeliveryFailed(other.to_string()),
                        });
                    shared.resolve(outcome);
                }
            }
        });
        provider
    }

    /// Registers a callback for the material.
    ///
    /// While acquisition is in flight the callback is queued; once the
    /// provider is terminal the callback fires immediately with the
    /// recorded outcome. Either way it fires on the connection's
    /// executor, never inline.
    pub fn register(&self, callback: SecretCallback) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            DeliveryState::Pending(callbacks) => callbacks.push(callback),
            DeliveryState::Delivered(material) => {
                let material = Arc::clone(material);
                drop(state);
                callback.complete(Ok(material));
            }
            DeliveryState::Failed(err) => {
                let err = err.clone();
                drop(state);
                callback.complete(Err(err));
            }
        }
    }

    /// Aborts a still-pending acquisition. Queued callbacks fail with
    /// [`Error::Closed`]; a provider that already delivered keeps its
    /// material.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        self.shared.resolve(Err(Error::Closed));
    }

    /// The delivered material, if acquisition already succeeded.
    pub fn material(&self) -> Option<Arc<TlsMaterial>> {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match &*state {
            DeliveryState::Delivered(material) => Some(Arc::clone(material)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConnectionMetadata;

    fn recording_callback(
        pipeline: &Pipeline,
        seen: Arc<Mutex<Vec<Result<()>>>>,
    ) -> SecretCallback {
        SecretCallback::new(
            pipeline.executor(),
            {
                let seen = Arc::clone(&seen);
                move |_, _| seen.lock().unwrap().push(Ok(()))
            },
            move |_, err| seen.lock().unwrap().push(Err(err)),
        )
    }

    fn empty_material() -> TlsMaterial {
        TlsMaterial {
            cert_chain: Vec::new(),
            key: None,
            trust_roots: Vec::new(),
        }
    }

    #[test]
    fn ready_provider_replays_material_to_late_registrations() {
        let mut pipeline = Pipeline::new(ConnectionMetadata::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let provider = SecretProvider::ready(empty_material());

        provider.register(recording_callback(&pipeline, Arc::clone(&seen)));
        provider.register(recording_callback(&pipeline, Arc::clone(&seen)));
        assert!(seen.lock().unwrap().is_empty(), "must not fire inline");

        pipeline.run_scheduled();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn failed_provider_replays_the_error() {
        let mut pipeline = Pipeline::new(ConnectionMetadata::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let provider = SecretProvider::failed(Error::SecretDeliveryFailed("boom".to_string()));

        provider.register(recording_callback(&pipeline, Arc::clone(&seen)));
        pipeline.run_scheduled();

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], Err(Error::SecretDeliveryFailed(_))));
    }

    #[tokio::test]
    async fn spawned_provider_delivers_exactly_once_per_callback() {
        let mut pipeline = Pipeline::new(ConnectionMetadata::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let provider = SecretProvider::spawn(
            &tokio::runtime::Handle::current(),
            Box::pin(async move {
                rx.await.map_err(|_| Error::Closed)?;
                Ok(empty_material())
            }),
        );

        provider.register(recording_callback(&pipeline, Arc::clone(&seen)));
        pipeline.run_scheduled();
        assert!(seen.lock().unwrap().is_empty(), "nothing before delivery");

        tx.send(()).unwrap();
        pipeline.await_scheduled().await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        // A registration after the terminal state still fires, once.
        provider.register(recording_callback(&pipeline, Arc::clone(&seen)));
        pipeline.await_scheduled().await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancel_fails_pending_callbacks_with_closed() {
        let mut pipeline = Pipeline::new(ConnectionMetadata::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let provider = SecretProvider::spawn(
            &tokio::runtime::Handle::current(),
            Box::pin(std::future::pending()),
        );
        provider.register(recording_callback(&pipeline, Arc::clone(&seen)));

        provider.cancel();
        pipeline.await_scheduled().await;

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], Err(Error::Closed)));
    }

    #[test]
    fn cancel_after_delivery_keeps_the_material() {
        let provider = SecretProvider::ready(empty_material());
        provider.cancel();
        assert!(provider.material().is_some());
    }
}
