use std::time::Duration;

use k8s_openapi::{
    api::core::v1::{HTTPGetAction, Probe},
    apimachinery::pkg::util::intstr::IntOrString,
};

/// Builds [`Probe`]s. The action has to be set before the period, and only a
/// builder with both can be built.
///
/// Thresholds that are never set are left empty so that the Kubernetes
/// defaults apply.
#[derive(Debug)]
pub struct ProbeBuilder<Action, Period> {
    action: Action,
    period: Period,

    failure_threshold: Option<i32>,
    timeout: Duration,
    initial_delay: Duration,
}

impl Default for ProbeBuilder<(), ()> {
    fn default() -> Self {
        Self {
            action: (),
            period: (),
            failure_threshold: None,
            // Matches the Kubernetes default
            timeout: Duration::from_secs(1),
            initial_delay: Duration::from_secs(0),
        }
    }
}

impl<Period> ProbeBuilder<(), Period> {
    /// This probe action does an HTTP GET request to the specified port and path.
    pub fn with_http_get_action_helper(
        self,
        port: u16,
        path: impl Into<String>,
        scheme: impl Into<String>,
    ) -> ProbeBuilder<HTTPGetAction, Period> {
        self.with_http_get_action(HTTPGetAction {
            path: Some(path.into()),
            port: IntOrString::Int(port.into()),
            scheme: Some(scheme.into()),
            ..HTTPGetAction::default()
        })
    }

    pub fn with_http_get_action(
        self,
        http_get_action: HTTPGetAction,
    ) -> ProbeBuilder<HTTPGetAction, Period> {
        let Self {
            action: (),
            period,
            failure_threshold,
            timeout,
            initial_delay,
        } = self;

        ProbeBuilder {
            action: http_get_action,
            period,
            failure_threshold,
            timeout,
            initial_delay,
        }
    }
}

impl ProbeBuilder<HTTPGetAction, ()> {
    /// The period/interval in which the probe should be executed.
    pub fn with_period(self, period: Duration) -> ProbeBuilder<HTTPGetAction, Duration> {
        let Self {
            action,
            period: (),
            failure_threshold,
            timeout,
            initial_delay,
        } = self;

        ProbeBuilder {
            action,
            period,
            failure_threshold,
            timeout,
            initial_delay,
        }
    }
}

impl ProbeBuilder<HTTPGetAction, Duration> {
    /// How often the probe must fail before being considered failed.
    pub fn with_failure_threshold(mut self, failure_threshold: i32) -> Self {
        self.failure_threshold = Some(failure_threshold);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn build(self) -> Probe {
        Probe {
            failure_threshold: self.failure_threshold,
            http_get: Some(self.action),
            initial_delay_seconds: Some(seconds(self.initial_delay)),
            period_seconds: Some(seconds(self.period)),
            timeout_seconds: Some(seconds(self.timeout)),
            ..Probe::default()
        }
    }
}

// Probe timings are whole seconds, anything beyond i32::MAX is saturated.
fn seconds(duration: Duration) -> i32 {
    duration.as_secs().try_into().unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_builder() {
        let probe = ProbeBuilder::default()
            .with_http_get_action_helper(8080, "/healthz", "HTTP")
            .with_period(Duration::from_secs(10))
            .with_initial_delay(Duration::from_secs(10))
            .with_failure_threshold(10)
            .build();

        assert_eq!(probe, Probe {
            failure_threshold: Some(10),
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_owned()),
                port: IntOrString::Int(8080),
                scheme: Some("HTTP".to_owned()),
                ..HTTPGetAction::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            timeout_seconds: Some(1),
            ..Probe::default()
        });
    }

    #[test]
    fn unset_failure_threshold_is_left_to_kubernetes() {
        let probe = ProbeBuilder::default()
            .with_http_get_action_helper(8080, "/healthz", "HTTP")
            .with_period(Duration::from_secs(10))
            .build();

        assert_eq!(probe.failure_threshold, None);
        assert_eq!(probe.success_threshold, None);
    }
}
