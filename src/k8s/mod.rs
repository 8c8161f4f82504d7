pub mod client;
pub mod kinds;
pub mod utils;
pub mod watch;

/// Default user agent for `NaviWatch` - automatically uses the package version
///
/// User-agent can be overridden via `NAVIWATCH_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
