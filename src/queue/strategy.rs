use super::ReconcileQueue;
use kube::Resource;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

pub const ENV_RECONCILE_STRATEGY: &str = "NAVIWATCH_RECONCILE_STRATEGY";

const CLUSTER_SCOPED: &str = "cluster-scoped";
const UNNAMED: &str = "Unnamed";
const GLOBAL: &str = "global";

/// How objects are spread over queues. Objects sharing a key share a queue
/// and are therefore reconciled one after another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconcileStrategy {
    /// One queue per kind
    #[default]
    Kind,
    /// One queue per kind and namespace
    KindNs,
    /// One queue per object
    KindNsName,
    /// A single queue for everything
    Global,
}

impl ReconcileStrategy {
    /// Strategy named by `NAVIWATCH_RECONCILE_STRATEGY`, `Kind` when unset or unknown
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(ENV_RECONCILE_STRATEGY)
            .ok()
            .map_or_else(Self::default, |raw| {
                raw.parse().unwrap_or_else(|_| {
                    warn!("Unknown reconcile strategy {:?}, using kind", raw);
                    Self::default()
                })
            })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kind => "kind",
            Self::KindNs => "kindNs",
            Self::KindNsName => "kindNsName",
            Self::Global => GLOBAL,
        }
    }

    /// Name of the queue `object` belongs to
    #[must_use]
    pub fn queue_key<K>(self, object: &K) -> String
    where
        K: Resource,
        K::DynamicType: Default,
    {
        let dt = K::DynamicType::default();
        let kind = K::kind(&dt);
        let meta = object.meta();
        let ns = meta.namespace.as_deref().unwrap_or(CLUSTER_SCOPED);
        let name = meta.name.as_deref().unwrap_or(UNNAMED);

        match self {
            Self::Kind => kind.into_owned(),
            Self::KindNs => format!("{kind}/{ns}"),
            Self::KindNsName => format!("{kind}/{ns}/{name}"),
            Self::Global => GLOBAL.to_string(),
        }
    }
}

impl FromStr for ReconcileStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "kind" => Ok(Self::Kind),
            "kindNs" => Ok(Self::KindNs),
            "kindNsName" => Ok(Self::KindNsName),
            "global" => Ok(Self::Global),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ReconcileStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lazily created queues, one per key
///
/// Under fine grained strategies every distinct key gets its own queue and
/// worker. Call [`QueueRegistry::prune_idle`] to release the ones with no
/// work left; watch sessions do so on every relist.
pub struct QueueRegistry<K> {
    strategy: ReconcileStrategy,
    queues: Mutex<HashMap<String, ReconcileQueue<K>>>,
}

impl<K> fmt::Debug for QueueRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl<K> QueueRegistry<K>
where
    K: Resource + Send + 'static,
    K::DynamicType: Default,
{
    #[must_use]
    pub fn new(strategy: ReconcileStrategy) -> Self {
        Self {
            strategy,
            queues: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::new(ReconcileStrategy::from_env())
    }

    #[must_use]
    pub const fn strategy(&self) -> ReconcileStrategy {
        self.strategy
    }

    /// Queue for `object`, created on first use
    pub fn queue_for(&self, object: &K) -> ReconcileQueue<K> {
        let key = self.strategy.queue_key(object);
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(key)
            .or_insert_with_key(|key| {
                debug!("Creating reconcile queue {}", key);
                ReconcileQueue::new(key)
            })
            .clone()
    }

    /// Drop queues that have nothing waiting or in flight and that no one
    /// else holds a handle to. Their workers exit once released. A later
    /// object with the same key gets a fresh queue.
    pub fn prune_idle(&self) -> usize {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let before = queues.len();
        queues.retain(|key, queue| {
            let keep = !queue.is_idle() || queue.handles() > 1;
            if !keep {
                debug!("Releasing idle reconcile queue {}", key);
            }
            keep
        });
        before - queues.len()
    }

    /// Keys of every live queue
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = queues.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::watch::ChangeKind;
    use crate::queue::Reconciler;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::ResourceExt;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn config_map(ns: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[test]
    fn test_queue_keys() {
        let cm = config_map("team-a", "settings");
        assert_eq!(ReconcileStrategy::Kind.queue_key(&cm), "ConfigMap");
        assert_eq!(ReconcileStrategy::KindNs.queue_key(&cm), "ConfigMap/team-a");
        assert_eq!(
            ReconcileStrategy::KindNsName.queue_key(&cm),
            "ConfigMap/team-a/settings"
        );
        assert_eq!(ReconcileStrategy::Global.queue_key(&cm), "global");
    }

    #[test]
    fn test_cluster_scoped_and_unnamed_fallbacks() {
        let ns = Namespace::default();
        assert_eq!(
            ReconcileStrategy::KindNsName.queue_key(&ns),
            "Namespace/cluster-scoped/Unnamed"
        );
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            "kindNs".parse::<ReconcileStrategy>(),
            Ok(ReconcileStrategy::KindNs)
        );
        assert_eq!(
            "global".parse::<ReconcileStrategy>(),
            Ok(ReconcileStrategy::Global)
        );
        assert!("bogus".parse::<ReconcileStrategy>().is_err());
        assert_eq!(ReconcileStrategy::default(), ReconcileStrategy::Kind);
    }

    #[tokio::test]
    async fn test_registry_reuses_queues() {
        let registry = QueueRegistry::<ConfigMap>::new(ReconcileStrategy::KindNs);
        let first = registry.queue_for(&config_map("a", "one"));
        let again = registry.queue_for(&config_map("a", "two"));
        let other = registry.queue_for(&config_map("b", "one"));

        assert_eq!(first.label(), again.label());
        assert_ne!(first.label(), other.label());
        assert_eq!(registry.keys(), vec!["ConfigMap/a", "ConfigMap/b"]);
    }

    #[tokio::test]
    async fn test_prune_releases_only_idle_queues() {
        let registry = QueueRegistry::<ConfigMap>::new(ReconcileStrategy::KindNsName);
        let (release, gate) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate)));
        let reconciler: Arc<dyn Reconciler<ConfigMap>> =
            Arc::new(move |cm: ConfigMap, _change: ChangeKind| {
                let gate = (cm.name_any() == "busy")
                    .then(|| gate.lock().unwrap().take())
                    .flatten();
                async move {
                    if let Some(gate) = gate {
                        gate.await?;
                    }
                    Ok::<(), anyhow::Error>(())
                }
            });

        let busy = registry
            .queue_for(&config_map("a", "busy"))
            .enqueue(config_map("a", "busy"), ChangeKind::Added, Arc::clone(&reconciler));
        registry
            .queue_for(&config_map("a", "done"))
            .enqueue(config_map("a", "done"), ChangeKind::Added, Arc::clone(&reconciler))
            .await
            .unwrap();
        let held = registry.queue_for(&config_map("a", "held"));
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.prune_idle(), 1);
        assert_eq!(registry.keys(), vec!["ConfigMap/a/busy", "ConfigMap/a/held"]);

        release.send(()).unwrap();
        busy.await.unwrap();
        drop(held);
        assert_eq!(registry.prune_idle(), 2);
        assert!(registry.is_empty());

        let fresh = registry.queue_for(&config_map("a", "done"));
        fresh
            .enqueue(config_map("a", "done"), ChangeKind::Modified, reconciler)
            .await
            .unwrap();
    }
}
