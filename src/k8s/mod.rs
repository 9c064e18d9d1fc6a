pub mod client;
pub mod watch;

/// Default user agent, automatically uses the package version
///
/// All clients should be created with `client::new(path, Some(USER_AGENT))`.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
