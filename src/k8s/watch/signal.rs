use super::config::SIGNAL_CHANNEL_CAPACITY;
use super::decode::ChangeKind;
use crate::error::Error;
use futures::{Stream, StreamExt};
use kube::{Resource, ResourceExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

/// Identity of an object carried by `Data` signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub uid: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    pub resource_version: Option<String>,
}

impl ObjectRef {
    #[must_use]
    pub fn of<K: Resource>(object: &K) -> Self {
        Self {
            uid: object.uid(),
            name: object.name_any(),
            namespace: object.namespace(),
            resource_version: object.resource_version(),
        }
    }
}

/// Summary of one list page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSummary {
    pub resource_version: Option<String>,
    pub items: usize,
    pub has_more: bool,
}

/// Lifecycle signals emitted by a watch session
#[derive(Debug, Clone)]
pub enum Signal {
    /// Stream opened; carries the request path
    Connect(String),
    NetworkError(Arc<Error>),
    /// A stream record or a callback failed
    DataError(Arc<Error>),
    /// Reconnect started; carries the failure count
    Reconnect(u32),
    GiveUp(Arc<Error>),
    Abort(String),
    Data { object: ObjectRef, change: ChangeKind },
    /// The server rejected the cursor; carries the discarded version
    OldResourceVersion(Option<String>),
    ReconnectPending,
    List(ListSummary),
    ListError(Arc<Error>),
    /// A list found the cache out of date; carries the relist window
    CacheMiss(String),
    IncResyncFailureCount(u32),
    /// A new relist window opened
    InitCacheMiss(String),
}

/// Discriminant of [`Signal`], used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Connect,
    NetworkError,
    DataError,
    Reconnect,
    GiveUp,
    Abort,
    Data,
    OldResourceVersion,
    ReconnectPending,
    List,
    ListError,
    CacheMiss,
    IncResyncFailureCount,
    InitCacheMiss,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::NetworkError => "network_error",
            Self::DataError => "data_error",
            Self::Reconnect => "reconnect",
            Self::GiveUp => "give_up",
            Self::Abort => "abort",
            Self::Data => "data",
            Self::OldResourceVersion => "old_resource_version",
            Self::ReconnectPending => "reconnect_pending",
            Self::List => "list",
            Self::ListError => "list_error",
            Self::CacheMiss => "cache_miss",
            Self::IncResyncFailureCount => "inc_resync_failure_count",
            Self::InitCacheMiss => "init_cache_miss",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Signal {
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Connect(_) => SignalKind::Connect,
            Self::NetworkError(_) => SignalKind::NetworkError,
            Self::DataError(_) => SignalKind::DataError,
            Self::Reconnect(_) => SignalKind::Reconnect,
            Self::GiveUp(_) => SignalKind::GiveUp,
            Self::Abort(_) => SignalKind::Abort,
            Self::Data { .. } => SignalKind::Data,
            Self::OldResourceVersion(_) => SignalKind::OldResourceVersion,
            Self::ReconnectPending => SignalKind::ReconnectPending,
            Self::List(_) => SignalKind::List,
            Self::ListError(_) => SignalKind::ListError,
            Self::CacheMiss(_) => SignalKind::CacheMiss,
            Self::IncResyncFailureCount(_) => SignalKind::IncResyncFailureCount,
            Self::InitCacheMiss(_) => SignalKind::InitCacheMiss,
        }
    }

    /// Short description of the payload, empty when there is none
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Connect(path) => path.clone(),
            Self::NetworkError(e) | Self::DataError(e) | Self::GiveUp(e) | Self::ListError(e) => {
                e.to_string()
            }
            Self::Reconnect(count) => {
                let plural = if *count == 1 { "" } else { "s" };
                format!("Reconnecting after {count} attempt{plural}")
            }
            Self::Abort(reason) => reason.clone(),
            Self::Data { object, change } => format!("{change} {}", object.name),
            Self::OldResourceVersion(rv) => rv.clone().unwrap_or_default(),
            Self::ReconnectPending => String::new(),
            Self::List(summary) => format!(
                "{} items at {}",
                summary.items,
                summary.resource_version.as_deref().unwrap_or("<none>")
            ),
            Self::CacheMiss(window) | Self::InitCacheMiss(window) => window.clone(),
            Self::IncResyncFailureCount(count) => count.to_string(),
        }
    }
}

/// Which signals a subscription wants
#[derive(Debug, Clone)]
pub enum SignalFilter {
    All,
    Kinds(Vec<SignalKind>),
}

impl SignalFilter {
    #[must_use]
    pub fn matches(&self, signal: &Signal) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&signal.kind()),
        }
    }
}

/// Typed publish/subscribe channel for session signals. Publishing never
/// blocks; slow subscribers lose the oldest signals.
#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<Signal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(SIGNAL_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, signal: Signal) {
        trace!("📣 {}", signal.kind());
        // No subscribers is fine
        let _ = self.sender.send(signal);
    }

    #[must_use]
    pub fn subscribe(&self) -> SignalSubscription {
        self.subscribe_filtered(SignalFilter::All)
    }

    #[must_use]
    pub fn subscribe_to(&self, kinds: &[SignalKind]) -> SignalSubscription {
        self.subscribe_filtered(SignalFilter::Kinds(kinds.to_vec()))
    }

    #[must_use]
    pub fn subscribe_filtered(&self, filter: SignalFilter) -> SignalSubscription {
        SignalSubscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of a [`SignalBus`]
#[derive(Debug)]
pub struct SignalSubscription {
    receiver: broadcast::Receiver<Signal>,
    filter: SignalFilter,
}

impl SignalSubscription {
    /// Next matching signal, `None` once every bus handle is gone
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) if self.filter.matches(&signal) => return Some(signal),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Signal subscriber lagged, {} signals dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching signal that is already buffered
    pub fn try_recv(&mut self) -> Option<Signal> {
        loop {
            match self.receiver.try_recv() {
                Ok(signal) if self.filter.matches(&signal) => return Some(signal),
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything buffered right now
    pub fn drain(&mut self) -> Vec<Signal> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = Signal> + Send + 'static {
        let filter = self.filter;
        BroadcastStream::new(self.receiver).filter_map(move |item| {
            let matched = item.ok().filter(|signal| filter.matches(signal));
            async move { matched }
        })
    }
}
