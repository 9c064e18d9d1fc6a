pub mod error;
pub mod gatherer;
pub mod k8s;
