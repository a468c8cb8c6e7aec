use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A management ingress instance. The operator keeps a single `Deployment` per instance
/// converged with this spec, and the `Deployment` is garbage collected together with it.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "operator.ibm.com",
    version = "v1alpha1",
    kind = "ManagementIngress",
    plural = "managementingresses",
    shortname = "mgmting",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ManagementIngressSpec {
    /// Image reference of the ingress controller, e.g. `quay.io/example/ingress:1.0`.
    pub image_repo: String,

    /// Resource requirements of the ingress container. Defaults are used if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Additional tolerations. Tolerations for memory and disk pressure are always added.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Comma separated list of allowed `Host` headers. Host header checks are disabled if empty.
    #[serde(default)]
    pub allowed_host_header: String,

    /// Namespace holding the identity provider configuration.
    pub iam_namespace: String,
}
