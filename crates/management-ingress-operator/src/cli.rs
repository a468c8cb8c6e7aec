//! Command line interface of the operator.
use std::time::Duration;

use clap::Parser;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};

use crate::{
    client::Client,
    deployment::rollout::{InvalidWaitOptions, RolloutWaitOptions},
    logging::LogFormat,
};

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(name = "management-ingress-operator", version, about)]
pub enum Command {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Wait for the deployment to become ready after it was created or updated.
    #[arg(long, env)]
    pub wait_for_rollout: bool,

    /// How often the deployment status is polled while waiting for the rollout.
    #[arg(long, env, default_value = "5s", value_parser = humantime::parse_duration)]
    pub rollout_poll_interval: Duration,

    /// How long to wait for the rollout before giving up, has to be longer than the poll
    /// interval.
    #[arg(long, env, default_value = "5m", value_parser = humantime::parse_duration)]
    pub rollout_timeout: Duration,

    #[arg(long, env = "MANAGEMENT_INGRESS_OPERATOR_LOG_FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,
}

impl RunArguments {
    /// The rollout wait settings, [`None`] if the operator should not wait.
    pub fn rollout_wait_options(&self) -> Result<Option<RolloutWaitOptions>, InvalidWaitOptions> {
        if !self.wait_for_rollout {
            return Ok(None);
        }
        RolloutWaitOptions::new(self.rollout_poll_interval, self.rollout_timeout).map(Some)
    }
}

/// The namespace the operator watches `ManagementIngress` objects in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            WatchNamespace::All
        } else {
            WatchNamespace::One(s.to_string())
        }
    }
}

impl WatchNamespace {
    /// Gets an API object for the namespace in question or for all namespaces,
    /// depending on which variant we are.
    pub fn get_api<T>(&self, client: &Client) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            WatchNamespace::All => client.get_all_api(),
            WatchNamespace::One(namespace) => client.get_api::<T>(namespace),
        }
    }
}
