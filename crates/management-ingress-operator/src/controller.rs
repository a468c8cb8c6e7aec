//! Reconciliation of [`ManagementIngress`] objects.
use std::{sync::Arc, time::Duration};

use kube::{
    Resource, ResourceExt,
    core::DynamicObject,
    runtime::{controller::Action, events::EventType, reflector::ObjectRef},
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::info;

use crate::{
    client::Client,
    crd::ManagementIngress,
    deployment::{
        self, APP_NAME, WorkloadConfig, build_deployment, build_pod_spec, selector_labels,
        rollout::{RolloutWaitOptions, WaitError, wait_for_deployment_ready},
    },
    event::{EventPublisher, KubeEventPublisher, error_chain_message},
    identity::{self, fetch_identity_inputs},
    logging::controller::ReconcilerError,
    reconcile::{self, DeploymentReconciler, ReconcileOutcome},
};

pub const CONTROLLER_NAME: &str = "managementingress";

const RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(5);

pub struct Ctx {
    pub client: Client,

    /// Wait for the rollout after every change, if set.
    pub rollout_wait: Option<RolloutWaitOptions>,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("object does not define an image"))]
    MissingImage,

    #[snafu(display("failed to fetch identity provider settings"))]
    FetchIdentityInputs { source: identity::Error },

    #[snafu(display("failed to build deployment"))]
    BuildDeployment { source: deployment::Error },

    #[snafu(display("failed to reconcile deployment"))]
    ReconcileDeployment { source: reconcile::Error },

    #[snafu(display("deployment rollout did not finish"))]
    WaitForRollout {
        source: WaitError,
        deployment: ObjectRef<k8s_openapi::api::apps::v1::Deployment>,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::ReconcileDeployment { source } => source.secondary_object(),
            Error::WaitForRollout { deployment, .. } => Some(deployment.clone().erase()),
            Error::ObjectHasNoNamespace
            | Error::MissingImage
            | Error::FetchIdentityInputs { .. }
            | Error::BuildDeployment { .. } => None,
        }
    }
}

pub async fn reconcile(ingress: Arc<ManagementIngress>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    tracing::info!("Starting reconcile");
    let namespace = ingress.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let events = KubeEventPublisher::new(
        ctx.client.as_kube_client(),
        CONTROLLER_NAME,
        ingress.object_ref(&()),
    );

    let deployment = match desired_deployment(&ingress, &namespace, &ctx.client).await {
        Ok(deployment) => deployment,
        Err(error) => {
            // Store failures are published by the reconciler, everything before it is ours
            events
                .publish(
                    EventType::Warning,
                    error.category(),
                    error_chain_message(&error),
                )
                .await;
            return Err(error);
        }
    };

    let reconciler =
        DeploymentReconciler::new(&ctx.client, &events, &namespace, ingress.name_any());
    let outcome = reconciler
        .create_or_update(&deployment)
        .await
        .context(ReconcileDeploymentSnafu)?;
    info!(outcome = <&'static str>::from(outcome), "Reconciled deployment");

    let removed = reconciler
        .remove_stale(&selector_labels(), APP_NAME)
        .await
        .context(ReconcileDeploymentSnafu)?;
    if !removed.is_empty() {
        info!(?removed, "Removed stale deployments");
    }

    if let Some(options) = &ctx.rollout_wait {
        if outcome != ReconcileOutcome::Unchanged {
            wait_for_deployment_ready(&ctx.client, &namespace, APP_NAME, options)
                .await
                .context(WaitForRolloutSnafu {
                    deployment: ObjectRef::new(APP_NAME).within(&namespace),
                })?;
        }
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn desired_deployment(
    ingress: &ManagementIngress,
    namespace: &str,
    client: &Client,
) -> Result<k8s_openapi::api::apps::v1::Deployment, Error> {
    let spec = &ingress.spec;
    ensure!(!spec.image_repo.is_empty(), MissingImageSnafu);

    let identity = fetch_identity_inputs(client, &spec.iam_namespace)
        .await
        .context(FetchIdentityInputsSnafu)?;
    let config = WorkloadConfig {
        image: spec.image_repo.clone(),
        resources: spec.resources.clone(),
        node_selector: spec.node_selector.clone(),
        tolerations: spec.tolerations.clone(),
        allowed_host_header: spec.allowed_host_header.clone(),
        oauth_client_id: identity.oauth_client_id,
        oidc_issuer_url: identity.oidc_issuer_url,
    };

    build_deployment(namespace, build_pod_spec(&config), ingress).context(BuildDeploymentSnafu)
}

pub fn error_policy(_obj: Arc<ManagementIngress>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}
