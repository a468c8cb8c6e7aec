//! Decides whether a deployed [`Deployment`] has drifted from the desired one.
//!
//! Only fields the operator controls are compared. Everything the API server owns
//! (`resourceVersion`, `uid`, `generation`, `managedFields`, `status`, ...) and every field it
//! defaults is ignored, comparing those would make every reconciliation an update.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::ResourceRequirements,
    },
    apimachinery::pkg::api::resource::Quantity as K8sQuantity,
};
use serde_json::Value;

use crate::quantity::Quantity;

/// Keys of string maps inside the pod template. These are compared exactly so that removing
/// an entry is detected, all other objects only have to contain what the desired one sets.
const EXACT_MAP_KEYS: &[&str] = &["annotations", "labels", "matchLabels", "nodeSelector"];

/// Pod spec and container fields taken from the user's configuration. They are compared
/// exactly, also when the desired object leaves them out, so that removing a value is an
/// update. `resources` is compared by quantity value, see [`resources_eq`].
const USER_SUPPLIED_KEYS: &[&str] = &["nodeSelector", "resources", "tolerations"];

/// Compares `current` against `desired` and builds the object to submit as update.
///
/// The returned object is based on `current`, so it keeps the `resourceVersion` observed on
/// the last fetch and all other server populated metadata. The boolean is `true` if any
/// controlled field differs.
pub fn reconcile_deployment(current: &Deployment, desired: &Deployment) -> (Deployment, bool) {
    let changed = has_drifted(current, desired);

    let mut merged = current.clone();
    merged.metadata.labels = desired.metadata.labels.clone();
    merged.metadata.owner_references = desired.metadata.owner_references.clone();

    let desired_spec = desired.spec.clone().unwrap_or_default();
    let merged_spec = merged.spec.get_or_insert_with(DeploymentSpec::default);
    merged_spec.selector = desired_spec.selector;
    merged_spec.template = desired_spec.template;
    if desired_spec.replicas.is_some() {
        merged_spec.replicas = desired_spec.replicas;
    }

    (merged, changed)
}

fn has_drifted(current: &Deployment, desired: &Deployment) -> bool {
    if current.metadata.labels.clone().unwrap_or_default()
        != desired.metadata.labels.clone().unwrap_or_default()
    {
        return true;
    }
    if current.metadata.owner_references.clone().unwrap_or_default()
        != desired.metadata.owner_references.clone().unwrap_or_default()
    {
        return true;
    }

    let current_spec = current.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.clone().unwrap_or_default();
    if current_spec.selector != desired_spec.selector {
        return true;
    }
    if desired_spec.replicas.is_some() && desired_spec.replicas != current_spec.replicas {
        return true;
    }

    match (
        serde_json::to_value(&desired_spec.template),
        serde_json::to_value(&current_spec.template),
    ) {
        (Ok(desired_template), Ok(current_template)) => {
            !is_semantic_subset(&desired_template, &current_template)
        }
        // Unreachable for Kubernetes types, an update is the safe answer
        _ => true,
    }
}

/// Returns `true` if everything set in `desired` is equal in `current`.
///
/// Fields `desired` does not set are ignored unless they are listed in
/// [`USER_SUPPLIED_KEYS`], arrays have to match element by element and the maps named in
/// [`EXACT_MAP_KEYS`] have to match exactly.
fn is_semantic_subset(desired: &Value, current: &Value) -> bool {
    match (desired, current) {
        (Value::Null, _) => true,
        (Value::Object(desired), Value::Object(current)) => {
            let removed_user_value = current.iter().any(|(key, current_value)| {
                USER_SUPPLIED_KEYS.contains(&key.as_str())
                    && !desired.contains_key(key)
                    && !is_empty(current_value)
            });
            !removed_user_value
                && desired.iter().all(|(key, desired_value)| {
                    let current_value = current.get(key).unwrap_or(&Value::Null);
                    match key.as_str() {
                        "resources" => resources_eq(desired_value, current_value),
                        key if key == "tolerations" || EXACT_MAP_KEYS.contains(&key) => {
                            exact_eq(desired_value, current_value)
                        }
                        _ => is_semantic_subset(desired_value, current_value),
                    }
                })
        }
        (Value::Array(desired), Value::Array(current)) => {
            desired.len() == current.len()
                && desired
                    .iter()
                    .zip(current)
                    .all(|(desired, current)| is_semantic_subset(desired, current))
        }
        // The API server drops empty collections and strings
        (Value::Array(desired), Value::Null) => desired.is_empty(),
        (Value::Object(desired), Value::Null) => desired.is_empty(),
        (Value::String(desired), Value::Null) => desired.is_empty(),
        (desired, current) => desired == current,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn exact_eq(desired: &Value, current: &Value) -> bool {
    desired == current || (is_empty(desired) && is_empty(current))
}

/// Compares two container `resources` objects. Limits and requests have to name the same
/// resources with equivalent quantities (`1Gi` equals `1024Mi`), claims have to match exactly.
fn resources_eq(desired: &Value, current: &Value) -> bool {
    let parse = |value: &Value| match value {
        Value::Null => Ok(ResourceRequirements::default()),
        value => serde_json::from_value::<ResourceRequirements>(value.clone()),
    };

    match (parse(desired), parse(current)) {
        (Ok(desired), Ok(current)) => {
            quantities_eq(desired.limits.as_ref(), current.limits.as_ref())
                && quantities_eq(desired.requests.as_ref(), current.requests.as_ref())
                && desired.claims.unwrap_or_default() == current.claims.unwrap_or_default()
        }
        // Not a resources object, an update is the safe answer
        _ => false,
    }
}

fn quantities_eq(
    desired: Option<&BTreeMap<String, K8sQuantity>>,
    current: Option<&BTreeMap<String, K8sQuantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let desired = desired.unwrap_or(&empty);
    let current = current.unwrap_or(&empty);

    desired.len() == current.len()
        && desired.iter().all(|(name, desired_quantity)| {
            current
                .get(name)
                .is_some_and(|current_quantity| quantity_eq(desired_quantity, current_quantity))
        })
}

fn quantity_eq(desired: &K8sQuantity, current: &K8sQuantity) -> bool {
    match (Quantity::try_from(desired), Quantity::try_from(current)) {
        (Ok(desired), Ok(current)) => desired.is_equivalent(&current),
        // The API server rejects invalid quantities, compare the text as a fallback
        _ => desired == current,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::DeploymentStatus,
        core::v1::{ResourceClaim, Toleration},
    };
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        deployment::{WorkloadConfig, build_deployment, build_pod_spec},
        test_utils::{owner, workload_config},
    };

    fn desired(config: &WorkloadConfig) -> Deployment {
        build_deployment("default", build_pod_spec(config), &owner("default", "ingress"))
            .unwrap()
    }

    /// What the API server hands back after creating `deployment`.
    fn as_stored(deployment: &Deployment, resource_version: &str) -> Deployment {
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(resource_version.to_string());
        stored.metadata.uid = Some("e2c2a4c8-0000-4000-8000-000000000001".to_string());
        stored.metadata.generation = Some(3);
        stored.metadata.annotations = Some(BTreeMap::from([(
            "deployment.kubernetes.io/revision".to_string(),
            "3".to_string(),
        )]));
        let spec = stored.spec.as_mut().unwrap();
        spec.replicas = Some(1);
        spec.revision_history_limit = Some(10);
        let pod_spec = spec.template.spec.as_mut().unwrap();
        pod_spec.restart_policy = Some("Always".to_string());
        pod_spec.dns_policy = Some("ClusterFirst".to_string());
        pod_spec.containers[0].termination_message_path = Some("/dev/termination-log".to_string());
        for env in pod_spec.containers[0].env.iter_mut().flatten() {
            if env.value.as_deref() == Some("") {
                env.value = None;
            }
        }
        stored.status = Some(DeploymentStatus {
            replicas: Some(1),
            ready_replicas: Some(1),
            ..DeploymentStatus::default()
        });
        stored
    }

    #[test]
    fn identical_builds_are_unchanged() {
        let config = workload_config("repo/img:v1");
        let (_, changed) = reconcile_deployment(&desired(&config), &desired(&config));
        assert!(!changed);
    }

    #[test]
    fn server_owned_and_defaulted_fields_are_ignored() {
        let config = workload_config("repo/img:v1");
        let current = as_stored(&desired(&config), "4711");

        let (_, changed) = reconcile_deployment(&current, &desired(&config));
        assert!(!changed);
    }

    #[rstest]
    #[case::image(WorkloadConfig { image: "repo/img:v2".to_string(), ..workload_config("repo/img:v1") })]
    #[case::resource_limits(WorkloadConfig {
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                K8sQuantity("512Mi".to_string()),
            )])),
            ..ResourceRequirements::default()
        }),
        ..workload_config("repo/img:v1")
    })]
    #[case::environment_value(WorkloadConfig { oidc_issuer_url: "https://other.example.com".to_string(), ..workload_config("repo/img:v1") })]
    #[case::node_selector(WorkloadConfig {
        node_selector: BTreeMap::from([("role".to_string(), "infra".to_string())]),
        ..workload_config("repo/img:v1")
    })]
    fn single_field_changes_are_detected(#[case] changed_config: WorkloadConfig) {
        let current = as_stored(&desired(&workload_config("repo/img:v1")), "4711");

        let (_, changed) = reconcile_deployment(&current, &desired(&changed_config));
        assert!(changed);
    }

    #[test]
    fn removed_node_selector_entry_is_detected() {
        let with_selector = WorkloadConfig {
            node_selector: BTreeMap::from([
                ("role".to_string(), "infra".to_string()),
                ("zone".to_string(), "a".to_string()),
            ]),
            ..workload_config("repo/img:v1")
        };
        let without_zone = WorkloadConfig {
            node_selector: BTreeMap::from([("role".to_string(), "infra".to_string())]),
            ..workload_config("repo/img:v1")
        };
        let current = as_stored(&desired(&with_selector), "1");

        let (_, changed) = reconcile_deployment(&current, &desired(&without_zone));
        assert!(changed);
    }

    #[test]
    fn changed_labels_are_detected() {
        let config = workload_config("repo/img:v1");
        let mut current = as_stored(&desired(&config), "1");
        current
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("app".to_string(), "edited".to_string());

        let (merged, changed) = reconcile_deployment(&current, &desired(&config));
        assert!(changed);
        assert_eq!(merged.metadata.labels, desired(&config).metadata.labels);
    }

    #[test]
    fn merged_object_keeps_server_metadata() {
        let current = as_stored(&desired(&workload_config("repo/img:v1")), "4711");
        let new_desired = desired(&workload_config("repo/img:v2"));
        assert_eq!(new_desired.metadata.resource_version, None);

        let (merged, changed) = reconcile_deployment(&current, &new_desired);

        assert!(changed);
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("4711"));
        assert_eq!(merged.metadata.uid, current.metadata.uid);
        assert_eq!(merged.metadata.annotations, current.metadata.annotations);
        assert_eq!(merged.status, current.status);

        let merged_spec = merged.spec.unwrap();
        assert_eq!(merged_spec.replicas, Some(1));
        assert_eq!(merged_spec.template, new_desired.spec.unwrap().template);
    }

    fn with_resources(
        limits: &[(&str, &str)],
        requests: &[(&str, &str)],
        claims: &[&str],
    ) -> WorkloadConfig {
        let quantities = |entries: &[(&str, &str)]| {
            (!entries.is_empty()).then(|| {
                entries
                    .iter()
                    .map(|(name, quantity)| {
                        (name.to_string(), K8sQuantity(quantity.to_string()))
                    })
                    .collect()
            })
        };
        WorkloadConfig {
            resources: Some(ResourceRequirements {
                limits: quantities(limits),
                requests: quantities(requests),
                claims: (!claims.is_empty()).then(|| {
                    claims
                        .iter()
                        .map(|name| ResourceClaim {
                            name: name.to_string(),
                            ..ResourceClaim::default()
                        })
                        .collect()
                }),
            }),
            ..workload_config("repo/img:v1")
        }
    }

    fn with_toleration(toleration: Toleration) -> WorkloadConfig {
        WorkloadConfig {
            tolerations: vec![toleration],
            ..workload_config("repo/img:v1")
        }
    }

    fn dedicated_toleration() -> Toleration {
        Toleration {
            key: Some("dedicated".to_string()),
            operator: Some("Equal".to_string()),
            value: Some("infra".to_string()),
            effect: Some("NoExecute".to_string()),
            toleration_seconds: Some(300),
        }
    }

    #[rstest]
    #[case::toleration_seconds(Toleration { toleration_seconds: None, ..dedicated_toleration() })]
    #[case::value(Toleration {
        operator: Some("Exists".to_string()),
        value: None,
        ..dedicated_toleration()
    })]
    fn removed_toleration_fields_are_detected(#[case] edited: Toleration) {
        let current = as_stored(&desired(&with_toleration(dedicated_toleration())), "1");

        let (merged, changed) =
            reconcile_deployment(&current, &desired(&with_toleration(edited.clone())));
        assert!(changed);
        let merged_pod_spec = merged.spec.unwrap().template.spec.unwrap();
        assert_eq!(merged_pod_spec.tolerations.unwrap()[0], edited);
    }

    #[test]
    fn removed_user_toleration_is_detected() {
        let current = as_stored(&desired(&with_toleration(dedicated_toleration())), "1");

        let (_, changed) =
            reconcile_deployment(&current, &desired(&workload_config("repo/img:v1")));
        assert!(changed);
    }

    #[test]
    fn removed_node_selector_is_detected() {
        let with_selector = WorkloadConfig {
            node_selector: BTreeMap::from([("role".to_string(), "infra".to_string())]),
            ..workload_config("repo/img:v1")
        };
        let current = as_stored(&desired(&with_selector), "1");

        let (_, changed) =
            reconcile_deployment(&current, &desired(&workload_config("repo/img:v1")));
        assert!(changed);
    }

    #[rstest]
    #[case::claims(
        with_resources(&[("memory", "256Mi")], &[], &["gpu"]),
        with_resources(&[("memory", "256Mi")], &[], &[]),
    )]
    #[case::request(
        with_resources(&[("memory", "256Mi")], &[("memory", "256Mi")], &[]),
        with_resources(&[("memory", "256Mi")], &[], &[]),
    )]
    #[case::limit(
        with_resources(&[("memory", "256Mi"), ("cpu", "1")], &[], &[]),
        with_resources(&[("memory", "256Mi")], &[], &[]),
    )]
    #[case::binary_vs_decimal(
        with_resources(&[("memory", "1Gi")], &[], &[]),
        with_resources(&[("memory", "1G")], &[], &[]),
    )]
    fn changed_resources_are_detected(
        #[case] before: WorkloadConfig,
        #[case] after: WorkloadConfig,
    ) {
        let current = as_stored(&desired(&before), "1");

        let (_, changed) = reconcile_deployment(&current, &desired(&after));
        assert!(changed);
    }

    #[rstest]
    #[case::memory(
        with_resources(&[("memory", "1Gi")], &[("memory", "1Gi")], &[]),
        with_resources(&[("memory", "1024Mi")], &[("memory", "1048576Ki")], &[]),
    )]
    #[case::cpu(
        with_resources(&[], &[("cpu", "500m")], &[]),
        with_resources(&[], &[("cpu", "0.5")], &[]),
    )]
    #[case::claims(
        with_resources(&[("memory", "256Mi")], &[], &["gpu"]),
        with_resources(&[("memory", "256Mi")], &[], &["gpu"]),
    )]
    fn equivalent_resources_are_unchanged(
        #[case] stored: WorkloadConfig,
        #[case] requested: WorkloadConfig,
    ) {
        let current = as_stored(&desired(&stored), "1");

        let (_, changed) = reconcile_deployment(&current, &desired(&requested));
        assert!(!changed);
    }

    #[rstest]
    #[case(json!({"a": 1}), json!({"a": 1, "b": 2}), true)]
    #[case(json!({"a": 1, "b": 2}), json!({"a": 1}), false)]
    #[case(json!({"a": [1, 2]}), json!({"a": [1]}), false)]
    #[case(json!({"a": []}), json!({}), true)]
    #[case(json!({"name": "A", "value": ""}), json!({"name": "A"}), true)]
    #[case(json!({"name": "A", "value": "x"}), json!({"name": "A"}), false)]
    #[case(json!({"labels": {"x": "1"}}), json!({"labels": {"x": "1", "y": "2"}}), false)]
    #[case(json!({"labels": {}}), json!({}), true)]
    #[case(json!({"nested": {"x": "1"}}), json!({"nested": {"x": "1", "y": "2"}}), true)]
    #[case(json!({"tolerations": [{"key": "a"}]}), json!({"tolerations": [{"key": "a", "tolerationSeconds": 300}]}), false)]
    #[case(json!({"tolerations": []}), json!({}), true)]
    #[case(json!({}), json!({"tolerations": [{"key": "a"}]}), false)]
    #[case(json!({}), json!({"nodeSelector": {}}), true)]
    #[case(json!({"resources": {"limits": {"memory": "1024Mi"}}}), json!({"resources": {"limits": {"memory": "1Gi"}}}), true)]
    #[case(json!({"resources": {"limits": {"memory": "1Gi"}}}), json!({"resources": {"limits": {"memory": "1Gi"}, "claims": [{"name": "gpu"}]}}), false)]
    fn semantic_subset(#[case] desired: Value, #[case] current: Value, #[case] expected: bool) {
        assert_eq!(is_semantic_subset(&desired, &current), expected);
    }
}
