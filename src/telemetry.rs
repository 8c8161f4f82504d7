use crate::k8s::watch::{Signal, SignalSubscription};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `RUST_LOG` driven subscriber, `info` when unset. A no-op if the
/// process already installed one.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Log every signal of a session until its bus goes away
pub fn spawn_signal_logger(mut subscription: SignalSubscription) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = subscription.recv().await {
            log_signal(&signal);
        }
    })
}

fn log_signal(signal: &Signal) {
    let kind = signal.kind();
    let detail = signal.detail();
    match signal {
        Signal::GiveUp(_) => error!("Watch event {} received. {}.", kind, detail),
        _ => debug!("Watch event {} received. {}.", kind, detail),
    }
}
