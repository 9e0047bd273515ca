//! Resilient watch over one resource collection.
//!
//! A [`ResourceWatcher`] owns one streaming subscription and keeps it alive:
//!
//! - it resumes from the last resourceVersion the server handed out, and
//!   falls back to a full relist (no resourceVersion) after a `410 Gone`
//! - while relisting, `ADDED` events for objects created before the stream
//!   started are replays of existing state and are not delivered
//! - read-idle timeouts and clean closes reconnect immediately; any other
//!   fault waits [`RETRY_BACKOFF`] first
//! - every disconnect opens a [`RECONNECT_DEADLINE`] window that a decodable
//!   event closes again; a read timeout or clean close opens a fresh window,
//!   while consecutive faults share one. When a window runs out the watcher
//!   turns fatal
//!
//! ```text
//! Idle -> Connecting -> Streaming -> (ReconnectWait) -> Connecting ... -> Fatal
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::client::ResourceClient;
use crate::k8s::client::StreamError;
use crate::k8s::client::StreamFrame;
use crate::k8s::client::StreamOptions;
use crate::k8s::client::WatchStream;
use crate::k8s::types::EventType;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::ResourceIdentity;
use crate::k8s::types::WatchEvent;
use crate::k8s::types::WireEventType;

/// How long a watch connection may stay silent.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Delay before reconnecting after an unexpected stream fault.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(1000);
/// Upper bound on one failure episode; matches the default etcd watch cache window.
pub const RECONNECT_DEADLINE: Duration = Duration::from_secs(300);

const GONE: u64 = 410;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSettings {
    pub watch_timeout: Duration,
    pub retry_backoff: Duration,
    pub reconnect_deadline: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            watch_timeout: WATCH_TIMEOUT,
            retry_backoff: RETRY_BACKOFF,
            reconnect_deadline: RECONNECT_DEADLINE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum WatcherPhase {
    Idle,
    Connecting,
    Streaming,
    ReconnectWait,
    Fatal,
}

/// Snapshot of a watcher's progress, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherStatus {
    pub phase: WatcherPhase,
    pub retry_count: u32,
    pub resource_version: Option<String>,
}

/// Receives every delivered event, in server order.
pub(crate) type EventSink = Box<dyn Fn(EventType, Value) + Send + Sync>;

/// Stream handles currently open across all watchers.
#[derive(Clone, Default)]
pub struct OpenStreams {
    streams: Arc<Mutex<HashMap<u64, ResourceIdentity>>>,
    next_id: Arc<AtomicU64>,
}

impl OpenStreams {
    fn track(&self, identity: &ResourceIdentity) -> StreamTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, identity.clone());
        StreamTicket {
            id,
            streams: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration of one open stream; dropping it releases the slot.
struct StreamTicket {
    id: u64,
    streams: OpenStreams,
}

impl Drop for StreamTicket {
    fn drop(&mut self) {
        self.streams
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Control handle for a watcher running in the background.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    identity: ResourceIdentity,
    token: CancellationToken,
    status: watch::Receiver<WatcherStatus>,
}

impl WatcherHandle {
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    pub fn status(&self) -> WatcherStatus {
        self.status.borrow().clone()
    }

    /// Tears the watch down. Safe to call repeatedly.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

struct WatcherState {
    /// `None` until the server has confirmed a live resourceVersion.
    last_resource_version: Option<String>,
    stream_started_at: DateTime<Utc>,
    retry_count: u32,
    reconnect_deadline: Option<Instant>,
}

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// Closed by the server, or a `410 Gone` forced a relist.
    Ended,
    /// No data within the watch timeout.
    ReadTimeout,
    /// Any other fault, including failing to connect.
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameOutcome {
    Delivered,
    Suppressed,
    Ignored,
    Malformed,
    Gone,
}

pub struct ResourceWatcher {
    identity: ResourceIdentity,
    client: Arc<dyn ResourceClient>,
    settings: WatcherSettings,
    streams: OpenStreams,
    sink: EventSink,
    token: CancellationToken,
    state: WatcherState,
    status: watch::Sender<WatcherStatus>,
}

impl ResourceWatcher {
    pub(crate) fn new(
        identity: ResourceIdentity,
        client: Arc<dyn ResourceClient>,
        settings: WatcherSettings,
        streams: OpenStreams,
        token: CancellationToken,
        sink: EventSink,
    ) -> (Self, WatcherHandle) {
        let (status, status_rx) = watch::channel(WatcherStatus {
            phase: WatcherPhase::Idle,
            retry_count: 1,
            resource_version: None,
        });
        let handle = WatcherHandle {
            identity: identity.clone(),
            token: token.clone(),
            status: status_rx,
        };
        let watcher = Self {
            identity,
            client,
            settings,
            streams,
            sink,
            token,
            state: WatcherState {
                last_resource_version: None,
                stream_started_at: now(),
                retry_count: 1,
                reconnect_deadline: None,
            },
            status,
        };
        (watcher, handle)
    }

    /// Runs the reconnect loop until stopped or the reconnect deadline passes.
    ///
    /// `first_attempt` fires once the first connect attempt has completed,
    /// whether or not it succeeded.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::ReconnectDeadlineExceeded`] if no healthy data
    ///   frame arrived within the deadline of a failure episode
    #[tracing::instrument(skip_all, fields(resource = %self.identity))]
    pub(crate) async fn run(
        mut self,
        first_attempt: Option<oneshot::Sender<()>>,
    ) -> Result<(), Report<KubernetesError>> {
        match self.run_loop(first_attempt).await {
            Ok(()) => {
                self.publish(WatcherPhase::Idle);
                info!("watch stopped");
                Ok(())
            }
            Err(report) => {
                self.publish(WatcherPhase::Fatal);
                error!("Failed to reconnect within timeout: {report:?}");
                Err(report)
            }
        }
    }

    async fn run_loop(
        &mut self,
        mut first_attempt: Option<oneshot::Sender<()>>,
    ) -> Result<(), Report<KubernetesError>> {
        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }
            let disconnect = self.connect_and_stream(&mut first_attempt).await?;
            match disconnect {
                Disconnect::Stopped => return Ok(()),
                Disconnect::ReadTimeout => {
                    debug!("stream read timed out, reconnecting");
                    self.restart_deadline();
                    self.state.retry_count = 1;
                }
                Disconnect::Ended => {
                    debug!("stream was closed, reconnecting");
                    self.restart_deadline();
                    self.state.retry_count = 1;
                }
                Disconnect::Failed => {
                    self.arm_deadline();
                    self.publish(WatcherPhase::ReconnectWait);
                    let backoff = tokio::time::sleep(self.settings.retry_backoff);
                    if self.guard(backoff).await?.is_none() {
                        return Ok(());
                    }
                    self.state.retry_count += 1;
                }
            }
        }
    }

    /// One connect attempt plus the life of the resulting stream.
    async fn connect_and_stream(
        &mut self,
        first_attempt: &mut Option<oneshot::Sender<()>>,
    ) -> Result<Disconnect, Report<KubernetesError>> {
        self.state.stream_started_at = now();
        self.publish(WatcherPhase::Connecting);

        let options = StreamOptions {
            timeout: self.settings.watch_timeout,
            resource_version: self.state.last_resource_version.clone(),
        };
        debug!(
            retry = self.state.retry_count,
            resource_version = ?options.resource_version,
            active_streams = self.streams.len(),
            "stream starting"
        );

        let opened = self
            .guard(self.client.open_stream(&self.identity, &options))
            .await;
        if let Some(tx) = first_attempt.take() {
            let _ = tx.send(());
        }
        let stream = match opened? {
            None => return Ok(Disconnect::Stopped),
            Some(Ok(stream)) => stream,
            Some(Err(report)) => {
                error!("error setting up watch: {report:?}");
                return Ok(Disconnect::Failed);
            }
        };

        let ticket = self.streams.track(&self.identity);
        self.publish(WatcherPhase::Streaming);
        let result = self.consume(stream).await;
        drop(ticket);
        result
    }

    async fn consume(&mut self, mut stream: WatchStream) -> Result<Disconnect, Report<KubernetesError>> {
        let disconnect = loop {
            let next = self.guard(stream.next()).await;
            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break Disconnect::Stopped,
                Err(report) => {
                    destroy(stream);
                    return Err(report);
                }
            };
            match frame {
                None | Some(StreamFrame::End) => break Disconnect::Ended,
                Some(StreamFrame::Error(StreamError::ReadTimeout(_))) => {
                    break Disconnect::ReadTimeout
                }
                Some(StreamFrame::Error(err)) => {
                    error!(error = %err, "stream encountered an error, reconnecting");
                    break Disconnect::Failed;
                }
                Some(StreamFrame::Data(value)) => {
                    if self.on_data(value) == FrameOutcome::Gone {
                        break Disconnect::Ended;
                    }
                }
            }
        };
        destroy(stream);
        Ok(disconnect)
    }

    /// Applies the per-frame rules and delivers the event if it survives them.
    fn on_data(&mut self, value: Value) -> FrameOutcome {
        let event: WatchEvent = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "invalid resource returned");
                return FrameOutcome::Malformed;
            }
        };

        // a decodable event means the connection is healthy
        if self.state.reconnect_deadline.take().is_some() {
            debug!("stream healthy again");
        }
        self.state.retry_count = 1;

        if event.event_type == WireEventType::Error {
            if event.status_code() == Some(GONE) {
                debug!(
                    resource_version = ?self.state.last_resource_version,
                    "the last seen resourceVersion was not found in etcd cache"
                );
                self.state.last_resource_version = None;
                self.publish_status();
                return FrameOutcome::Gone;
            }
            warn!(status = %event.object, "watch returned an error");
            return FrameOutcome::Ignored;
        }

        let Some(metadata) = event.metadata() else {
            debug!(frame = %event.object, "invalid resource returned");
            return FrameOutcome::Malformed;
        };

        let Some(event_type) = event.event_type.normalized() else {
            // bookmarks only move an established resume point
            if self.state.last_resource_version.is_some() {
                if let Some(resource_version) = metadata.resource_version {
                    self.state.last_resource_version = Some(resource_version);
                    self.publish_status();
                }
            }
            return FrameOutcome::Ignored;
        };

        if self.is_replay(event_type, &metadata) {
            return FrameOutcome::Suppressed;
        }

        debug!(
            event = %event_type,
            name = ?metadata.name,
            resource_version = ?metadata.resource_version,
            "saw resource"
        );
        if let Some(resource_version) = metadata.resource_version {
            self.state.last_resource_version = Some(resource_version);
            self.publish_status();
        }
        (self.sink)(event_type, event.object);
        FrameOutcome::Delivered
    }

    fn is_replay(&self, event_type: EventType, metadata: &ObjectMeta) -> bool {
        self.state.last_resource_version.is_none()
            && event_type == EventType::Added
            && metadata
                .creation_timestamp
                .as_ref()
                .is_some_and(|created| created.0 < self.state.stream_started_at)
    }

    /// Starts the deadline unless a failure episode already runs one.
    fn arm_deadline(&mut self) {
        if self.state.reconnect_deadline.is_none() {
            self.restart_deadline();
        }
    }

    fn restart_deadline(&mut self) {
        self.state.reconnect_deadline = Some(Instant::now() + self.settings.reconnect_deadline);
    }

    /// Awaits `fut` unless the watcher is stopped (`None`) or the reconnect deadline passes.
    async fn guard<F: Future>(&self, fut: F) -> Result<Option<F::Output>, Report<KubernetesError>> {
        let deadline = self.state.reconnect_deadline;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Ok(None),
            _ = sleep_until(deadline) => Err(Report::new(
                KubernetesError::ReconnectDeadlineExceeded {
                    identity: self.identity.to_string(),
                    deadline: self.settings.reconnect_deadline,
                },
            )),
            output = fut => Ok(Some(output)),
        }
    }

    fn publish(&self, phase: WatcherPhase) {
        self.status.send_replace(WatcherStatus {
            phase,
            retry_count: self.state.retry_count,
            resource_version: self.state.last_resource_version.clone(),
        });
    }

    fn publish_status(&self) {
        let phase = self.status.borrow().phase;
        self.publish(phase);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Releases a stream's connection.
fn destroy(stream: WatchStream) {
    drop(stream);
}

fn now() -> DateTime<Utc> {
    Utc::now()
}
