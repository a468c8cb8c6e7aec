//! Waiting for a [`Deployment`] rollout to become ready.
//!
//! [`wait_for_deployment_ready`] polls the store until [`check_deployment_ready`] succeeds:
//!
//! ```text
//! Polling --ready--------------------> Ready
//! Polling --NotFound-----------------> Disappeared
//! Polling --other fetch error--------> Fetch
//! Polling --timeout elapsed----------> TimedOut
//! ```
//!
//! Only "not ready yet" is retried. The wait uses [`tokio::time`], so it can be driven by a
//! paused clock, and dropping the returned future cancels it.
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::client::{DeploymentStore, StoreError};

/// The reason why a [`Deployment`] is not ready yet. Returned by [`check_deployment_ready`].
#[derive(Debug, PartialEq, Eq, Snafu)]
#[snafu(module(unready_deployment))]
pub enum DeploymentRolloutInProgress {
    /// The deployment controller has not reported any status for the deployment yet.
    #[snafu(display("no status has been reported for the deployment yet"))]
    NotYetObserved,

    #[snafu(display("only {ready_replicas} out of {replicas} replicas are ready"))]
    HasUnreadyReplicas { replicas: i32, ready_replicas: i32 },
}

/// Checks whether all replicas reported in the [`Deployment`] status are ready.
pub fn check_deployment_ready(deployment: &Deployment) -> Result<(), DeploymentRolloutInProgress> {
    use unready_deployment::*;

    let status = deployment.status.as_ref().context(NotYetObservedSnafu)?;
    let replicas = status.replicas.unwrap_or(0);
    let ready_replicas = status.ready_replicas.unwrap_or(0);
    ensure!(replicas == ready_replicas, HasUnreadyReplicasSnafu {
        replicas,
        ready_replicas
    });

    Ok(())
}

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum InvalidWaitOptions {
    #[snafu(display(
        "rollout timeout ({timeout:?}) must be longer than the poll interval ({poll_interval:?})"
    ))]
    TimeoutNotLongerThanInterval {
        poll_interval: Duration,
        timeout: Duration,
    },

    #[snafu(display("poll interval must not be zero"))]
    ZeroPollInterval,
}

/// How often and for how long [`wait_for_deployment_ready`] polls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolloutWaitOptions {
    poll_interval: Duration,
    timeout: Duration,
}

impl RolloutWaitOptions {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Fails unless `poll_interval` is non-zero and strictly shorter than `timeout`.
    pub fn new(poll_interval: Duration, timeout: Duration) -> Result<Self, InvalidWaitOptions> {
        ensure!(!poll_interval.is_zero(), ZeroPollIntervalSnafu);
        ensure!(timeout > poll_interval, TimeoutNotLongerThanIntervalSnafu {
            poll_interval,
            timeout
        });

        Ok(Self {
            poll_interval,
            timeout,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for RolloutWaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum WaitError {
    #[snafu(display("deployment {name:?} disappeared while waiting for it to become ready"))]
    Disappeared { source: StoreError, name: String },

    #[snafu(display("failed to fetch deployment {name:?} while waiting for it to become ready"))]
    Fetch { source: StoreError, name: String },

    #[snafu(display(
        "deployment {name:?} did not become ready within {timeout:?} ({polls} polls, last state: {last_state})"
    ))]
    TimedOut {
        name: String,
        timeout: Duration,
        polls: usize,
        last_state: String,
    },
}

/// Polls the deployment `name` until all of its replicas are ready.
///
/// The first poll happens immediately, then once per poll interval. Returns the number of polls
/// it took.
#[tracing::instrument(skip(store, options), fields(deployment.name = name))]
pub async fn wait_for_deployment_ready(
    store: &dyn DeploymentStore,
    namespace: &str,
    name: &str,
    options: &RolloutWaitOptions,
) -> Result<usize, WaitError> {
    let started = Instant::now();
    let mut polls = 0;
    let mut last_state: Option<DeploymentRolloutInProgress> = None;

    let polling = async {
        let mut interval = tokio::time::interval(options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            polls += 1;

            let deployment = match store.get(namespace, name).await {
                Ok(deployment) => deployment,
                Err(source @ StoreError::NotFound { .. }) => {
                    return Err(source).context(DisappearedSnafu { name });
                }
                Err(source) => return Err(source).context(FetchSnafu { name }),
            };

            match check_deployment_ready(&deployment) {
                Ok(()) => return Ok(polls),
                Err(in_progress) => {
                    debug!(poll = polls, %in_progress, "Deployment is not ready yet");
                    last_state = Some(in_progress);
                }
            }
        }
    };

    let result = tokio::time::timeout(options.timeout, polling).await;
    match result {
        Ok(Ok(polls)) => {
            info!(
                polls,
                elapsed = ?started.elapsed(),
                "Deployment is ready"
            );
            Ok(polls)
        }
        Ok(Err(error)) => Err(error),
        Err(_elapsed) => TimedOutSnafu {
            name,
            timeout: options.timeout,
            polls,
            last_state: last_state
                .map(|state| state.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        }
        .fail(),
    }
}
