pub mod error;
pub mod k8s;
pub mod queue;
pub mod telemetry;

pub use error::{Error, Result};
pub use k8s::client::{ApiRequest, ApiResponse, HttpExecutor, RequestExecutor};
pub use k8s::kinds::{Filters, ResourceKind};
pub use k8s::watch::{ChangeKind, Signal, SignalKind, WatchConfig, WatchHandle, WatchSession};
pub use queue::{QueueRegistry, ReconcileError, ReconcileQueue, ReconcileStrategy, Reconciler};
