//! Construction of the desired management ingress [`Deployment`].
//!
//! Everything in here is pure: the same [`WorkloadConfig`] always results in the same
//! [`Deployment`], which is what makes the diff in [`diff`] meaningful.
use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            PodSpec, PodTemplateSpec, ResourceRequirements, SecretVolumeSource,
            SecurityContext, Toleration, Volume,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector},
};
use kube::Resource;
use snafu::{ResultExt, Snafu};

use crate::builder::{
    container::{ContainerBuilder, FieldPathEnvVar},
    meta::ObjectMetaBuilder,
    probe::ProbeBuilder,
};

pub mod diff;
pub mod rollout;

pub const APP_NAME: &str = "management-ingress";
pub const SERVICE_ACCOUNT_NAME: &str = "management-ingress";
pub const TLS_SECRET_NAME: &str = "icp-management-ingress-tls-secret";

pub const HTTPS_PORT: u16 = 8443;
pub const HTTP_PORT: u16 = 8080;
pub const HEALTH_CHECK_PATH: &str = "/healthz";

const TLS_VOLUME_NAME: &str = "tls-secret";
const TLS_MOUNT_PATH: &str = "/var/run/secrets/tls";
const TLS_SECRET_DEFAULT_MODE: i32 = 0o644;
const CRITICAL_POD_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/critical-pod";
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 30;

const DEFAULT_MEMORY: &str = "256Mi";
const DEFAULT_CPU_REQUEST: &str = "200m";

const PROBE_PERIOD: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_INITIAL_DELAY: Duration = Duration::from_secs(10);
const LIVENESS_FAILURE_THRESHOLD: i32 = 10;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind deployment {APP_NAME:?} to its owner"))]
    BindOwner { source: crate::builder::meta::Error },
}

/// Everything the ingress workload is derived from.
///
/// The values are expected to be validated by the caller, building never fails.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkloadConfig {
    pub image: String,
    pub resources: Option<ResourceRequirements>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub allowed_host_header: String,
    pub oauth_client_id: String,
    pub oidc_issuer_url: String,
}

/// The environment of the ingress container. Every variable the container gets is a field here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerEnvironment<'a> {
    pub enable_impersonation: bool,
    pub apiserver_secure_port: u16,
    pub cluster_domain: &'a str,
    pub allowed_host_headers: &'a str,
    pub oidc_issuer_url: &'a str,
    pub oauth_client_id: &'a str,
    pub fips_enabled: bool,
}

impl<'a> ContainerEnvironment<'a> {
    pub fn from_config(config: &'a WorkloadConfig) -> Self {
        Self {
            enable_impersonation: false,
            apiserver_secure_port: 6443,
            cluster_domain: "mycluster.cp",
            allowed_host_headers: &config.allowed_host_header,
            oidc_issuer_url: &config.oidc_issuer_url,
            oauth_client_id: &config.oauth_client_id,
            fips_enabled: false,
        }
    }

    /// Host header checks are only enabled if there is something to check against.
    pub fn host_headers_check_enabled(&self) -> bool {
        !self.allowed_host_headers.is_empty()
    }

    fn apply(&self, container: &mut ContainerBuilder) {
        container
            .add_env_var("ENABLE_IMPERSONATION", self.enable_impersonation.to_string())
            .add_env_var("APISERVER_SECURE_PORT", self.apiserver_secure_port.to_string())
            .add_env_var("CLUSTER_DOMAIN", self.cluster_domain)
            .add_env_var(
                "HOST_HEADERS_CHECK_ENABLED",
                self.host_headers_check_enabled().to_string(),
            )
            .add_env_var("ALLOWED_HOST_HEADERS", self.allowed_host_headers)
            .add_env_var("OIDC_ISSUER_URL", self.oidc_issuer_url)
            .add_env_var("WLP_CLIENT_ID", self.oauth_client_id)
            .add_env_var_from_field_path("POD_NAME", FieldPathEnvVar::Name)
            .add_env_var_from_field_path("POD_NAMESPACE", FieldPathEnvVar::Namespace)
            .add_env_var("FIPS_ENABLED", self.fips_enabled.to_string());
    }
}

/// Labels identifying the ingress pods. They are used as selector as well as on the objects.
pub fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_NAME.to_string()),
        ("component".to_string(), APP_NAME.to_string()),
    ])
}

/// Resources used if the user did not configure any.
pub fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(DEFAULT_MEMORY.to_string()),
        )])),
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(DEFAULT_CPU_REQUEST.to_string())),
            ("memory".to_string(), Quantity(DEFAULT_MEMORY.to_string())),
        ])),
        ..ResourceRequirements::default()
    }
}

/// Tolerations every ingress pod gets in addition to the user provided ones.
fn infrastructure_tolerations() -> [Toleration; 2] {
    ["node.kubernetes.io/memory-pressure", "node.kubernetes.io/disk-pressure"].map(|key| {
        Toleration {
            key: Some(key.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Toleration::default()
        }
    })
}

fn container_command() -> Vec<String> {
    vec![
        "/icp-management-ingress".to_string(),
        format!("--default-ssl-certificate=$(POD_NAMESPACE)/{TLS_SECRET_NAME}"),
        format!("--configmap=$(POD_NAMESPACE)/{APP_NAME}"),
        format!("--http-port={HTTP_PORT}"),
        format!("--https-port={HTTPS_PORT}"),
    ]
}

/// Builds the pod spec of the ingress workload.
pub fn build_pod_spec(config: &WorkloadConfig) -> PodSpec {
    let health_check = || {
        ProbeBuilder::default()
            .with_http_get_action_helper(HTTP_PORT, HEALTH_CHECK_PATH, "HTTP")
            .with_period(PROBE_PERIOD)
            .with_timeout(PROBE_TIMEOUT)
            .with_initial_delay(PROBE_INITIAL_DELAY)
    };

    let mut container = ContainerBuilder::new(APP_NAME);
    container
        .image(&config.image)
        .image_pull_policy("IfNotPresent")
        .resources(config.resources.clone().unwrap_or_else(default_resources))
        .add_container_port("https", HTTPS_PORT.into(), "TCP")
        .add_container_port("http", HTTP_PORT.into(), "TCP")
        .command(container_command())
        .security_context(SecurityContext {
            privileged: Some(false),
            allow_privilege_escalation: Some(false),
            ..SecurityContext::default()
        })
        .liveness_probe(
            health_check()
                .with_failure_threshold(LIVENESS_FAILURE_THRESHOLD)
                .build(),
        )
        .readiness_probe(health_check().build())
        .add_volume_mount(TLS_VOLUME_NAME, TLS_MOUNT_PATH);
    ContainerEnvironment::from_config(config).apply(&mut container);

    let mut tolerations = config.tolerations.clone();
    tolerations.extend(infrastructure_tolerations());

    PodSpec {
        containers: vec![container.build()],
        service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
        node_selector: (!config.node_selector.is_empty()).then(|| config.node_selector.clone()),
        tolerations: Some(tolerations),
        volumes: Some(vec![Volume {
            name: TLS_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(TLS_SECRET_NAME.to_string()),
                default_mode: Some(TLS_SECRET_DEFAULT_MODE),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        }]),
        termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
        ..PodSpec::default()
    }
}

/// Wraps `pod_spec` into the ingress [`Deployment`] in `namespace`, owned by `owner`.
///
/// The owner reference is part of the built object, so even the first create attempt
/// submits an owned object.
pub fn build_deployment<T>(namespace: &str, pod_spec: PodSpec, owner: &T) -> Result<Deployment>
where
    T: Resource<DynamicType = ()>,
{
    let labels = selector_labels();
    let metadata = ObjectMetaBuilder::new()
        .name(APP_NAME)
        .namespace(namespace)
        .ownerreference_from_resource(owner, Some(true), Some(true))
        .context(BindOwnerSnafu)?
        .with_labels(labels.clone())
        .build();
    let template_metadata = ObjectMetaBuilder::new()
        .name(APP_NAME)
        .with_labels(labels.clone())
        .with_annotation(CRITICAL_POD_ANNOTATION, "")
        .build();

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(template_metadata),
                spec: Some(pod_spec),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    })
}
