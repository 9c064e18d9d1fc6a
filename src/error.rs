use derive_more::From;
use k8s_openapi::serde_json;
use std::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Yaml(serde_yaml::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Watch(kube::runtime::watcher::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    Kubeconfig(kube::config::KubeconfigError),

    #[from]
    Io(std::io::Error),

    /// Rejected gatherer configuration
    Config(String),

    /// The requested resource type is not served by the cluster
    UnknownResource(String),

    /// A watch subscription could not be established
    Subscribe { scope: String, source: Box<Error> },

    /// `wait_for_cache_sync` ran past its deadline
    SyncTimeout(Duration),

    /// The stop signal fired before the operation completed
    Cancelled,

    /// `run` was called on a gatherer that was already started
    AlreadyRunning,

    /// `fetch` was called before the initial listing completed
    NotSynced,

    /// Custom error message
    Custom(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::SyncTimeout(_) | Self::NotSynced)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Json(e) => write!(fmt, "json: {e}"),
            Self::Yaml(e) => write!(fmt, "yaml: {e}"),
            Self::Kube(e) => write!(fmt, "kube: {e}"),
            Self::Watch(e) => write!(fmt, "watch: {e}"),
            Self::Infer(e) => write!(fmt, "kube config: {e}"),
            Self::Kubeconfig(e) => write!(fmt, "kubeconfig: {e}"),
            Self::Io(e) => write!(fmt, "io: {e}"),
            Self::Config(msg) => write!(fmt, "invalid configuration: {msg}"),
            Self::UnknownResource(gvr) => write!(fmt, "resource type not found: {gvr}"),
            Self::Subscribe { scope, source } => {
                write!(fmt, "failed to watch {scope}: {source}")
            }
            Self::SyncTimeout(limit) => {
                write!(fmt, "timed out after {limit:?} waiting for cache sync")
            }
            Self::Cancelled => write!(fmt, "stopped before the operation completed"),
            Self::AlreadyRunning => write!(fmt, "data gatherer is already running"),
            Self::NotSynced => write!(fmt, "data gatherer cache has not synced yet"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Yaml(e) => Some(e),
            Self::Kube(e) => Some(e),
            Self::Watch(e) => Some(e),
            Self::Infer(e) => Some(e),
            Self::Kubeconfig(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Subscribe { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
