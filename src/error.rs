use derive_more::From;
use k8s_openapi::serde_json;

use crate::queue::ReconcileError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Http(reqwest::Error),

    #[from]
    Io(std::io::Error),

    #[from]
    Reconcile(ReconcileError),

    /// The server answered with a non-success status
    Status { status: u16, status_text: String },

    InvalidUrl(String),

    /// A filter was assigned twice on the same builder
    FilterAlreadySet(String),

    AlreadyStarted,

    /// The watch cursor was rejected with 410 Gone
    StaleResourceVersion(Option<String>),

    /// The resync budget was exhausted and the session gave up
    RetryLimitExceeded(u32),

    /// An object without `metadata.uid` cannot be cached
    MissingUid(String),

    /// Custom error message
    Custom(String),
}

impl Error {
    #[must_use]
    pub fn status(status: u16, status_text: impl Into<String>) -> Self {
        Self::Status {
            status,
            status_text: status_text.into(),
        }
    }

    /// `true` when the error means the server forgot our resource version
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::StaleResourceVersion(_) | Self::Status { status: 410, .. }
        )
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Json(e) => write!(fmt, "decode failed: {e}"),
            Self::Http(e) => write!(fmt, "request failed: {e}"),
            Self::Io(e) => write!(fmt, "io failed: {e}"),
            Self::Reconcile(e) => write!(fmt, "{e}"),
            Self::Status {
                status,
                status_text,
            } => write!(fmt, "{status} {status_text}"),
            Self::InvalidUrl(url) => write!(fmt, "invalid url: {url}"),
            Self::FilterAlreadySet(filter) => write!(fmt, "filter `{filter}` is already set"),
            Self::AlreadyStarted => write!(fmt, "watch session already started"),
            Self::StaleResourceVersion(rv) => write!(
                fmt,
                "resource version {} is too old",
                rv.as_deref().unwrap_or("<none>")
            ),
            Self::RetryLimitExceeded(max) => {
                write!(fmt, "Retry limit ({max}) exceeded, giving up")
            }
            Self::MissingUid(name) => write!(fmt, "object {name} has no metadata.uid"),
            Self::Custom(message) => write!(fmt, "{message}"),
        }
    }
}

impl std::error::Error for Error {}
