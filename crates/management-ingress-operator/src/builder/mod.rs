//! Builders for the Kubernetes objects managed by this operator.
pub mod container;
pub mod meta;
pub mod probe;
