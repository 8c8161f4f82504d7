pub mod cache;
pub mod config;
pub mod decode;
pub mod session;
pub mod signal;
pub mod state;

pub use cache::{CacheEntry, ObjectCache};
pub use config::WatchConfig;
pub use decode::{ChangeKind, LineBuffer};
pub use session::{WatchHandle, WatchSession};
pub use signal::{ListSummary, ObjectRef, Signal, SignalBus, SignalFilter, SignalKind, SignalSubscription};
pub use state::{Input, LastSeen, Phase};
