//! Kubernetes operator that keeps the management ingress `Deployment` converged with its
//! `ManagementIngress` resource.
pub mod builder;
pub mod cli;
pub mod client;
pub mod controller;
pub mod crd;
pub mod deployment;
pub mod event;
pub mod identity;
pub mod logging;
pub mod quantity;
pub mod reconcile;

#[cfg(test)]
mod test_utils;
