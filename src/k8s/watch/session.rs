/**
 * Watch Session
 *
 * Keeps a local view of one Kubernetes collection in sync with the API
 * server. A session lists the collection, opens a watch stream at the listed
 * resource version and heals itself when the stream dies, goes quiet or the
 * cursor expires. All work for a session runs on a single driver task, so
 * lists and stream events never interleave.
 */
use super::cache::{ObjectCache, describe};
use super::config::{WatchConfig, timer_jitter, timer_period};
use super::decode::{ChangeKind, LineBuffer, ResourceList, WatchRecord, decode_line};
use super::signal::{ListSummary, ObjectRef, Signal, SignalBus};
use super::state::{Input, LastSeen, Phase, ResyncAction, resync_action};
use crate::error::{Error, Result};
use crate::k8s::client::{ApiRequest, ApiResponse, RequestExecutor, ResponseBody};
use crate::k8s::kinds::{CollectionQuery, Filters, ResourceKind};
use crate::queue::{QueueRegistry, ReconcileError, Reconciler};
use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const GONE: u16 = 410;

/// Handle returned by [`WatchSession::start`]
#[derive(Debug)]
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl WatchHandle {
    /// Stop the session. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that stops the session when cancelled
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the session to end
    ///
    /// # Errors
    ///
    /// Returns `RetryLimitExceeded` if the session gave up, or an error if
    /// the driver task panicked
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Custom(format!("watch driver failed: {e}")))?
    }
}

/// List-then-watch session for one (kind, filters) pair
pub struct WatchSession<K> {
    kind: ResourceKind,
    filters: Filters,
    executor: Arc<dyn RequestExecutor>,
    reconciler: Arc<dyn Reconciler<K>>,
    queues: Option<Arc<QueueRegistry<K>>>,
    config: WatchConfig,
    signals: SignalBus,
    cancel: CancellationToken,
    started: bool,
}

impl<K> WatchSession<K>
where
    K: Resource + Clone + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    #[must_use]
    pub fn new(
        kind: ResourceKind,
        filters: Filters,
        executor: Arc<dyn RequestExecutor>,
        reconciler: Arc<dyn Reconciler<K>>,
        config: WatchConfig,
    ) -> Self {
        Self {
            kind,
            filters,
            executor,
            reconciler,
            queues: None,
            config,
            signals: SignalBus::new(),
            cancel: CancellationToken::new(),
            started: false,
        }
    }

    /// Route changes through ordered reconcile queues instead of calling the
    /// reconciler directly
    #[must_use]
    pub fn with_queue(mut self, registry: Arc<QueueRegistry<K>>) -> Self {
        self.queues = Some(registry);
        self
    }

    /// Bus carrying this session's signals. Subscribe before `start` to see
    /// the first ones.
    #[must_use]
    pub const fn signals(&self) -> &SignalBus {
        &self.signals
    }

    /// Stable short id of this (kind, filters) pair
    ///
    /// # Errors
    ///
    /// Returns an error if the request path can not be built
    pub fn cache_id(&self) -> Result<String> {
        self.filters.cache_id(&self.kind)
    }

    /// Stop the session. Safe to call more than once, and before `start`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Run the first list and connect, then hand the session to a background
    /// driver task
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call
    pub async fn start(&mut self) -> Result<WatchHandle> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.started = true;

        let mut driver = Driver {
            kind: self.kind.clone(),
            filters: self.filters.clone(),
            executor: Arc::clone(&self.executor),
            reconciler: Arc::clone(&self.reconciler),
            queues: self.queues.clone(),
            config: self.config.clone(),
            signals: self.signals.clone(),
            cancel: self.cancel.clone(),
            cache: ObjectCache::new(),
            resource_version: None,
            phase: Phase::Idle,
            last_seen: LastSeen::Unset,
            failures: 0,
            window: relist_window(),
            path: String::new(),
            connecting: None,
            stream: None,
            lines: LineBuffer::new(),
        };

        info!(
            "🔍 Starting watch for {} ({})",
            self.kind.plural(),
            self.filters.path(&self.kind, false)
        );
        driver.signals.emit(Signal::InitCacheMiss(driver.window.clone()));
        driver.phase = driver.phase.on(Input::Start);
        driver.begin_watch().await;

        Ok(WatchHandle {
            cancel: self.cancel.clone(),
            task: tokio::spawn(driver.run()),
        })
    }
}

fn relist_window() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Everything a running session owns. Lives on the driver task.
struct Driver<K> {
    kind: ResourceKind,
    filters: Filters,
    executor: Arc<dyn RequestExecutor>,
    reconciler: Arc<dyn Reconciler<K>>,
    queues: Option<Arc<QueueRegistry<K>>>,
    config: WatchConfig,
    signals: SignalBus,
    cancel: CancellationToken,
    cache: ObjectCache<K>,
    resource_version: Option<String>,
    phase: Phase,
    last_seen: LastSeen,
    failures: u32,
    /// Relist window reported with cache misses
    window: String,
    /// Path of the current watch request
    path: String,
    /// Watch request sent but not answered yet
    connecting: Option<BoxFuture<'static, ApiResponse>>,
    stream: Option<ResponseBody>,
    lines: LineBuffer,
}

impl<K> Driver<K>
where
    K: Resource + Clone + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn run(mut self) -> Result<()> {
        let now = Instant::now();
        let resync_delay = timer_period(self.config.resync_delay);
        let relist_interval = timer_period(self.config.relist_interval);
        let mut resync = interval_at(now + resync_delay + timer_jitter(), resync_delay);
        let mut relist = interval_at(now + relist_interval + timer_jitter(), relist_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        relist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.abort();
                    return Ok(());
                }
                // Timers first so a busy stream cannot starve them
                _ = resync.tick() => {
                    self.resync().await?;
                }
                _ = relist.tick() => {
                    self.relist().await;
                }
                response = next_response(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connect(response);
                }
                chunk = next_chunk(&mut self.stream), if self.stream.is_some() => {
                    self.on_chunk(chunk);
                }
            }
        }
    }

    /// List, then send the watch request
    async fn begin_watch(&mut self) {
        self.list().await;
        if self.cancel.is_cancelled() {
            return;
        }
        self.connect();
    }

    /// Full list, abandoned as soon as the session is cancelled
    async fn list(&mut self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            () = self.list_pages() => {}
        }
    }

    async fn list_pages(&mut self) {
        let mut removals = self.cache.snapshot();
        let mut continue_token: Option<String> = None;

        loop {
            let query = CollectionQuery {
                continue_token: continue_token.as_deref(),
                ..CollectionQuery::default()
            };
            let url = match self
                .filters
                .collection_url(self.executor.server_url(), &self.kind, &query)
            {
                Ok(url) => url,
                Err(e) => return self.list_failed(e),
            };

            debug!("📋 Listing {}", url);
            let response = self.executor.execute(ApiRequest::get(url)).await;
            if !response.ok {
                return self.list_failed(response.error());
            }
            let page: ResourceList<K> = match response.json().await {
                Ok(page) => page,
                Err(e) => return self.list_failed(e),
            };

            let next = page.continue_token().map(ToString::to_string);
            self.signals.emit(Signal::List(ListSummary {
                resource_version: page.metadata.resource_version.clone(),
                items: page.items.len(),
                has_more: next.is_some(),
            }));

            for object in page.items {
                self.reconcile_listed(object, &mut removals);
            }

            if next.is_none() {
                self.resource_version = page.metadata.resource_version;
                break;
            }
            continue_token = next;
        }

        for (uid, object) in removals {
            self.signals.emit(Signal::CacheMiss(self.window.clone()));
            self.cache.remove(&uid);
            self.dispatch(object, ChangeKind::Deleted);
        }
        debug!(
            "📋 List complete: {} cached at {}",
            self.cache.len(),
            self.resource_version.as_deref().unwrap_or("<none>")
        );
    }

    fn list_failed(&self, e: Error) {
        warn!("List of {} failed: {}", self.kind.plural(), e);
        self.signals.emit(Signal::ListError(Arc::new(e)));
    }

    /// Compare one listed object against the cache
    fn reconcile_listed(&mut self, object: K, removals: &mut HashMap<String, K>) {
        let Some(uid) = object.uid() else {
            self.data_error(Error::MissingUid(describe(&object)));
            return;
        };

        if !self.cache.contains(&uid) {
            self.signals.emit(Signal::CacheMiss(self.window.clone()));
            self.cache.upsert(uid, object.clone());
            self.dispatch(object, ChangeKind::Added);
            return;
        }

        removals.remove(&uid);
        if self.cache.is_newer(&uid, &object) {
            self.signals.emit(Signal::CacheMiss(self.window.clone()));
            self.cache.upsert(uid, object.clone());
            self.dispatch(object, ChangeKind::Modified);
        }
    }

    fn connect(&mut self) {
        let query = CollectionQuery {
            watch: true,
            resource_version: self.resource_version.as_deref(),
            ..CollectionQuery::default()
        };
        let url = match self
            .filters
            .collection_url(self.executor.server_url(), &self.kind, &query)
        {
            Ok(url) => url,
            Err(e) => {
                self.network_error(e);
                return;
            }
        };

        debug!("🔌 Opening watch {}", url);
        self.path = url.path().to_string();
        let executor = Arc::clone(&self.executor);
        self.connecting = Some(Box::pin(async move {
            executor.execute(ApiRequest::get(url)).await
        }));
    }

    fn on_connect(&mut self, response: ApiResponse) {
        if response.ok {
            info!("✅ Watch connected: {}", self.path);
            self.signals.emit(Signal::Connect(self.path.clone()));
            self.failures = 0;
            self.signals.emit(Signal::IncResyncFailureCount(0));
            self.lines.clear();
            self.stream = Some(response.body);
            self.phase = self.phase.on(Input::Connected);
        } else if response.status == GONE {
            self.stale_cursor();
        } else {
            self.network_error(response.error());
        }
    }

    fn on_chunk(&mut self, chunk: Option<Result<Bytes>>) {
        match chunk {
            Some(Ok(bytes)) => {
                for line in self.lines.push(&bytes) {
                    if !self.on_line(&line) {
                        break;
                    }
                }
            }
            Some(Err(e)) => self.network_error(e),
            None => {
                debug!("Watch stream {} ended", self.path);
                if let Some(line) = self.lines.finish() {
                    if !self.on_line(&line) {
                        return;
                    }
                }
                self.close_stream();
                self.liveness_failure();
            }
        }
    }

    /// Handle one stream line. Returns `false` once the stream was torn down.
    fn on_line(&mut self, line: &str) -> bool {
        let decoded = decode_line::<K>(line);
        if decoded.envelope_ok {
            self.last_seen = LastSeen::ObservedAt(Instant::now());
        }

        match decoded.record {
            Ok(WatchRecord::Change(change, object)) => {
                self.apply_change(change, object);
                true
            }
            Ok(WatchRecord::Gone) => {
                self.stale_cursor();
                false
            }
            Ok(WatchRecord::Failure(message)) => {
                self.data_error(Error::Custom(message));
                true
            }
            Err(e) => {
                self.data_error(e);
                true
            }
        }
    }

    /// Cache update for one stream event. The cursor only moves on list.
    fn apply_change(&mut self, change: ChangeKind, object: K) {
        match change {
            ChangeKind::Added | ChangeKind::Modified => {
                let Some(uid) = object.uid() else {
                    self.data_error(Error::MissingUid(describe(&object)));
                    return;
                };
                self.cache.upsert(uid, object.clone());
            }
            ChangeKind::Deleted => {
                if let Some(uid) = object.uid() {
                    self.cache.remove(&uid);
                }
            }
            ChangeKind::Bookmark | ChangeKind::Error => {}
        }
        self.dispatch(object, change);
    }

    /// Hand a change to the reconciler, through a queue when configured
    fn dispatch(&self, object: K, change: ChangeKind) {
        self.signals.emit(Signal::Data {
            object: ObjectRef::of(&object),
            change,
        });

        let signals = self.signals.clone();
        if let Some(registry) = &self.queues {
            let completion = registry.queue_for(&object).enqueue(
                object,
                change,
                Arc::clone(&self.reconciler),
            );
            tokio::spawn(async move {
                if let Err(e) = completion.await {
                    signals.emit(Signal::DataError(Arc::new(e.into())));
                }
            });
        } else {
            let reconciler = Arc::clone(&self.reconciler);
            tokio::spawn(async move {
                if let Err(e) = reconciler.reconcile(object, change).await {
                    signals.emit(Signal::DataError(Arc::new(ReconcileError::Failed(e).into())));
                }
            });
        }
    }

    fn data_error(&self, e: Error) {
        debug!("Watch data error on {}: {}", self.path, e);
        self.signals.emit(Signal::DataError(Arc::new(e)));
    }

    fn network_error(&mut self, e: Error) {
        warn!("Watch network error on {}: {}", self.path, e);
        self.signals.emit(Signal::NetworkError(Arc::new(e)));
        self.close_stream();
        self.liveness_failure();
    }

    /// 410 Gone: forget the cursor so the next list starts fresh
    fn stale_cursor(&mut self) {
        let previous = self.resource_version.take();
        warn!("{}, relisting", Error::StaleResourceVersion(previous.clone()));
        self.signals.emit(Signal::OldResourceVersion(previous));
        self.close_stream();
        self.liveness_failure();
    }

    /// Ask the next resync check to reconnect
    fn liveness_failure(&mut self) {
        self.last_seen = LastSeen::ForcedResync;
        self.phase = self.phase.on(Input::Disconnected);
    }

    fn close_stream(&mut self) {
        self.stream = None;
        self.connecting = None;
        self.lines.clear();
    }

    async fn resync(&mut self) -> Result<()> {
        let now = Instant::now();
        let action = resync_action(
            self.last_seen,
            now,
            self.config.last_seen_limit,
            self.config.within_budget(self.failures),
            self.phase,
        );
        if action == ResyncAction::Skip {
            return Ok(());
        }
        self.last_seen = LastSeen::ObservedAt(now);

        match action {
            ResyncAction::Skip => Ok(()),
            ResyncAction::Coalesce => {
                self.failures += 1;
                self.signals.emit(Signal::IncResyncFailureCount(self.failures));
                debug!("Reconnect already pending for {}", self.path);
                self.signals.emit(Signal::ReconnectPending);
                Ok(())
            }
            ResyncAction::Reconnect => {
                self.failures += 1;
                self.signals.emit(Signal::IncResyncFailureCount(self.failures));
                self.phase = self.phase.on(Input::ResyncDue);
                info!("🔄 Reconnecting watch, attempt {}", self.failures);
                self.signals.emit(Signal::Reconnect(self.failures));
                self.close_stream();
                self.begin_watch().await;
                Ok(())
            }
            ResyncAction::GiveUp => {
                let max = self.config.resync_failure_max.unwrap_or_default();
                error!("❌ Retry limit ({}) exceeded for {}, giving up", max, self.path);
                self.signals
                    .emit(Signal::GiveUp(Arc::new(Error::RetryLimitExceeded(max))));
                self.phase = self.phase.on(Input::BudgetExhausted);
                self.close_stream();
                self.cancel.cancel();
                Err(Error::RetryLimitExceeded(max))
            }
        }
    }

    async fn relist(&mut self) {
        self.window = relist_window();
        debug!("Relisting {} for window {}", self.kind.plural(), self.window);
        self.signals.emit(Signal::InitCacheMiss(self.window.clone()));
        if let Some(registry) = &self.queues {
            let released = registry.prune_idle();
            if released > 0 {
                debug!("Released {} idle reconcile queues", released);
            }
        }
        self.list().await;
    }

    fn abort(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.close_stream();
        self.phase = self.phase.on(Input::Abort);
        info!("🛑 Watch {} closed", self.path);
        self.signals
            .emit(Signal::Abort("watch session closed".to_string()));
    }
}

async fn next_response(connecting: &mut Option<BoxFuture<'static, ApiResponse>>) -> ApiResponse {
    match connecting {
        Some(request) => request.await,
        None => std::future::pending().await,
    }
}

async fn next_chunk(stream: &mut Option<ResponseBody>) -> Option<Result<Bytes>> {
    match stream {
        Some(body) => body.next().await,
        None => std::future::pending().await,
    }
}
