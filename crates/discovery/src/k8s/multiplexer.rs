use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use error_stack::Report;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::k8s::client::ResourceClient;
use crate::k8s::types::decode;
use crate::k8s::types::EventSelection;
use crate::k8s::types::EventType;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::ResourceIdentity;
use crate::k8s::watcher::OpenStreams;
use crate::k8s::watcher::ResourceWatcher;
use crate::k8s::watcher::WatcherHandle;
use crate::k8s::watcher::WatcherSettings;

pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns a set of resource watchers and starts them together.
///
/// Watchers registered through [`WatchMultiplexer::watch`] are queued and
/// only connect once [`WatchMultiplexer::start`] runs. The client's API
/// surface is initialised exactly once no matter how many callers race on
/// `start`.
pub struct WatchMultiplexer {
    client: Arc<dyn ResourceClient>,
    settings: WatcherSettings,
    init_timeout: Duration,
    initialized: OnceCell<()>,
    init_started: AtomicBool,
    pending: Mutex<Vec<ResourceWatcher>>,
    handles: Mutex<Vec<WatcherHandle>>,
    streams: OpenStreams,
    shutdown: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<Report<KubernetesError>>,
    fatal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Report<KubernetesError>>>,
}

impl WatchMultiplexer {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self::with_settings(client, WatcherSettings::default(), DEFAULT_INIT_TIMEOUT)
    }

    pub fn with_settings(
        client: Arc<dyn ResourceClient>,
        settings: WatcherSettings,
        init_timeout: Duration,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            client,
            settings,
            init_timeout,
            initialized: OnceCell::new(),
            init_started: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            streams: OpenStreams::default(),
            shutdown: CancellationToken::new(),
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
        }
    }

    /// Queues a typed watch; nothing connects until [`Self::start`].
    ///
    /// `handler` only sees the event types in `selection`. Objects that do
    /// not decode as `K` are logged and dropped.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::UnknownResource`] if `K` is not in the client's registry
    /// - [`KubernetesError::InvalidScope`] if a namespace is given for a cluster scoped kind
    pub fn watch<K, F>(
        &self,
        namespace: Option<&str>,
        selection: EventSelection,
        handler: F,
    ) -> Result<WatcherHandle, Report<KubernetesError>>
    where
        K: k8s_openapi::Resource + DeserializeOwned + 'static,
        F: Fn(EventType, K) + Send + Sync + 'static,
    {
        let mut identity = ResourceIdentity::of::<K>();
        if let Some(namespace) = namespace {
            identity = identity.in_namespace(namespace);
        }
        self.watch_dynamic(identity, selection, move |event_type, object| {
            match decode::<K>(object) {
                Ok(resource) => handler(event_type, resource),
                Err(report) => debug!("dropping undecodable {}: {report:?}", K::KIND),
            }
        })
    }

    /// Queues a watch that hands objects over as raw JSON.
    pub fn watch_dynamic<F>(
        &self,
        identity: ResourceIdentity,
        selection: EventSelection,
        handler: F,
    ) -> Result<WatcherHandle, Report<KubernetesError>>
    where
        F: Fn(EventType, Value) + Send + Sync + 'static,
    {
        self.client.registry().lookup(&identity)?;

        let (watcher, handle) = ResourceWatcher::new(
            identity,
            self.client.clone(),
            self.settings.clone(),
            self.streams.clone(),
            self.shutdown.child_token(),
            Box::new(move |event_type, object| {
                if selection.matches(event_type) {
                    handler(event_type, object);
                }
            }),
        );
        debug!(resource = %handle.identity(), "watch queued");
        lock(&self.pending).push(watcher);
        lock(&self.handles).push(handle.clone());
        Ok(handle)
    }

    /// Initialises the client once, then starts every queued watcher in order.
    ///
    /// Returns once each newly started watcher has made its first connect
    /// attempt; the watchers keep reconnecting in the background.
    ///
    /// # Errors
    ///
    /// - whatever the client's `init` fails with
    /// - [`KubernetesError::InitTimeout`] if another caller's initialisation
    ///   did not finish within the init timeout
    pub async fn start(&self) -> Result<(), Report<KubernetesError>> {
        self.initialize().await?;

        let pending = std::mem::take(&mut *lock(&self.pending));
        if pending.is_empty() {
            return Ok(());
        }
        info!(watchers = pending.len(), "starting watches");
        for watcher in pending {
            let (first_attempt_tx, first_attempt_rx) = oneshot::channel();
            let fatal_tx = self.fatal_tx.clone();
            tokio::spawn(async move {
                if let Err(report) = watcher.run(Some(first_attempt_tx)).await {
                    let _ = fatal_tx.send(report);
                }
            });
            // the sender is dropped without firing if the watch was stopped first
            let _ = first_attempt_rx.await;
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<(), Report<KubernetesError>> {
        let init = self
            .initialized
            .get_or_try_init(|| async { self.client.init().await });

        let first_caller = self
            .init_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first_caller {
            let result = init.await.map(|_| ());
            if result.is_err() {
                self.init_started.store(false, Ordering::Release);
            }
            return result;
        }

        tokio::time::timeout(self.init_timeout, init)
            .await
            .map_err(|_| {
                Report::new(KubernetesError::InitTimeout {
                    timeout: self.init_timeout,
                })
            })?
            .map(|_| ())
    }

    /// Closes every open stream. Safe to call repeatedly and while
    /// reconnects are in flight.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(active_streams = self.streams.len(), "stopping watches");
        }
        for handle in lock(&self.handles).iter() {
            handle.stop();
        }
        self.shutdown.cancel();
    }

    /// Number of stream connections currently open.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Resolves when any watcher gives up for good.
    pub async fn fatal_error(&self) -> Option<Report<KubernetesError>> {
        self.fatal_rx.lock().await.recv().await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
