pub mod clock;
pub mod config;
pub mod controller;
pub mod dynamic;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod namespaces;
pub mod sanitize;
pub mod source;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock, Timestamp};
pub use config::{ConfigDynamic, ControllerSettings, GroupVersionResource};
pub use controller::{ControllerState, WatchController};
pub use dynamic::{DynamicGatherer, GatheredList};
#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeCluster;
pub use namespaces::generate_field_selector;
pub use sanitize::Sanitizer;
pub use source::{EventSource, EventStream, ResourceEvent, WatchScope};
pub use store::{CacheStats, GatheredResource, ObjectKey, ResourceCache};
