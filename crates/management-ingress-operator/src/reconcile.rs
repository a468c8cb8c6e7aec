//! Create-or-update reconciliation of the management ingress [`Deployment`].
//!
//! [`DeploymentReconciler::create_or_update`] first tries to create the desired object. Only if
//! it already exists, the current object is fetched, diffed and, if it drifted, replaced using
//! the `resourceVersion` of the fetched object. A stale `resourceVersion` fails the update, it is
//! up to the caller to retry the whole reconciliation.
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    ResourceExt,
    core::DynamicObject,
    runtime::{events::EventType, reflector::ObjectRef},
};
use snafu::{OptionExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    client::{DeploymentStore, StoreError},
    deployment::diff::reconcile_deployment,
    event::{EventPublisher, error_chain_message, reasons},
    logging::controller::ReconcilerError,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to create deployment {deployment:?} for {owner:?}"))]
    CreateDeployment {
        source: StoreError,
        deployment: ObjectRef<Deployment>,
        owner: String,
    },

    #[snafu(display("failed to get deployment {deployment:?} for {owner:?}"))]
    GetDeployment {
        source: StoreError,
        deployment: ObjectRef<Deployment>,
        owner: String,
    },

    #[snafu(display("failed to update deployment {deployment:?} for {owner:?}"))]
    UpdateDeployment {
        source: StoreError,
        deployment: ObjectRef<Deployment>,
        owner: String,
    },

    #[snafu(display("failed to delete deployment {deployment:?} for {owner:?}"))]
    DeleteDeployment {
        source: StoreError,
        deployment: ObjectRef<Deployment>,
        owner: String,
    },

    #[snafu(display("failed to list deployments in namespace {namespace:?} for {owner:?}"))]
    ListDeployments {
        source: StoreError,
        namespace: String,
        owner: String,
    },

    #[snafu(display("desired deployment has no name"))]
    MissingDeploymentName,
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::CreateDeployment { deployment, .. }
            | Error::GetDeployment { deployment, .. }
            | Error::UpdateDeployment { deployment, .. }
            | Error::DeleteDeployment { deployment, .. } => Some(deployment.clone().erase()),
            Error::ListDeployments { .. } | Error::MissingDeploymentName => None,
        }
    }
}

impl Error {
    /// The [`StoreError`] that caused this error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Error::CreateDeployment { source, .. }
            | Error::GetDeployment { source, .. }
            | Error::UpdateDeployment { source, .. }
            | Error::DeleteDeployment { source, .. }
            | Error::ListDeployments { source, .. } => Some(source),
            Error::MissingDeploymentName => None,
        }
    }
}

/// The terminal state of a successful [`DeploymentReconciler::create_or_update`].
///
/// Failures are reported as [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Reconciles the deployment of a single owner.
///
/// Everything is passed in explicitly, a reconciler is cheap to construct for every
/// reconciliation and holds no state between them.
pub struct DeploymentReconciler<'a> {
    store: &'a dyn DeploymentStore,
    events: &'a dyn EventPublisher,
    namespace: String,
    owner_name: String,
}

impl<'a> DeploymentReconciler<'a> {
    pub fn new(
        store: &'a dyn DeploymentStore,
        events: &'a dyn EventPublisher,
        namespace: impl Into<String>,
        owner_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            events,
            namespace: namespace.into(),
            owner_name: owner_name.into(),
        }
    }

    /// Makes the deployed object match `desired`, which has to be owner bound already.
    ///
    /// Emits one event for every outcome except [`ReconcileOutcome::Unchanged`].
    #[tracing::instrument(
        skip_all,
        fields(owner.name = %self.owner_name, deployment.name = tracing::field::Empty)
    )]
    pub async fn create_or_update(&self, desired: &Deployment) -> Result<ReconcileOutcome> {
        let name = desired
            .metadata
            .name
            .clone()
            .context(MissingDeploymentNameSnafu)?;
        let namespace = desired.namespace().unwrap_or_else(|| self.namespace.clone());
        tracing::Span::current().record("deployment.name", name.as_str());
        let deployment = ObjectRef::<Deployment>::new(&name).within(&namespace);

        info!("Creating or updating deployment");
        match self.store.create(desired).await {
            Ok(_) => {
                self.events
                    .publish(
                        EventType::Normal,
                        reasons::CREATED_DEPLOYMENT,
                        format!("Successfully created deployment {name:?}"),
                    )
                    .await;
                return Ok(ReconcileOutcome::Created);
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!("Deployment already exists, comparing it with the desired state");
            }
            Err(source) => {
                return Err(self
                    .fail(reasons::CREATED_DEPLOYMENT, Error::CreateDeployment {
                        source,
                        deployment,
                        owner: self.owner_name.clone(),
                    })
                    .await);
            }
        }

        let current = match self.store.get(&namespace, &name).await {
            Ok(current) => current,
            Err(source) => {
                return Err(self
                    .fail(reasons::UPDATED_DEPLOYMENT, Error::GetDeployment {
                        source,
                        deployment,
                        owner: self.owner_name.clone(),
                    })
                    .await);
            }
        };

        let (merged, changed) = reconcile_deployment(&current, desired);
        if !changed {
            debug!("Deployment is up to date");
            return Ok(ReconcileOutcome::Unchanged);
        }

        info!(
            resource_version = merged.metadata.resource_version.as_deref(),
            "Deployment has drifted from the desired state, updating it"
        );
        match self.store.update(&merged).await {
            Ok(_) => {
                self.events
                    .publish(
                        EventType::Normal,
                        reasons::UPDATED_DEPLOYMENT,
                        format!("Successfully updated deployment {name:?}"),
                    )
                    .await;
                Ok(ReconcileOutcome::Updated)
            }
            Err(source) => Err(self
                .fail(reasons::UPDATED_DEPLOYMENT, Error::UpdateDeployment {
                    source,
                    deployment,
                    owner: self.owner_name.clone(),
                })
                .await),
        }
    }

    /// Deletes the deployment `name`. A deployment that does not exist is not an error.
    #[tracing::instrument(skip(self), fields(owner.name = %self.owner_name))]
    pub async fn remove(&self, name: &str) -> Result<()> {
        info!("Deleting deployment");
        match self.store.delete(&self.namespace, name).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound { .. }) => {
                debug!("Deployment was already gone");
                Ok(())
            }
            Err(source) => Err(Error::DeleteDeployment {
                source,
                deployment: ObjectRef::new(name).within(&self.namespace),
                owner: self.owner_name.clone(),
            }),
        }
    }

    /// Lists the deployments in the owner's namespace that carry all `selector` labels.
    pub async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Deployment>> {
        self.store
            .list(&self.namespace, selector)
            .await
            .map_err(|source| Error::ListDeployments {
                source,
                namespace: self.namespace.clone(),
                owner: self.owner_name.clone(),
            })
    }

    /// Deletes every deployment that carries the `selector` labels and belongs to this owner,
    /// except `keep`. Returns the names of the deleted deployments.
    #[tracing::instrument(skip(self, selector), fields(owner.name = %self.owner_name))]
    pub async fn remove_stale(
        &self,
        selector: &BTreeMap<String, String>,
        keep: &str,
    ) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for deployment in self.list(selector).await? {
            let name = deployment.name_any();
            let owned = deployment
                .owner_references()
                .iter()
                .any(|reference| reference.name == self.owner_name);
            if name == keep || !owned {
                continue;
            }

            info!(deployment.name = name.as_str(), "Found stale deployment");
            self.remove(&name).await?;
            removed.push(name);
        }
        Ok(removed)
    }

    /// Publishes `error` as warning and hands it back.
    async fn fail(&self, reason: &str, error: Error) -> Error {
        warn!(error = &error as &dyn std::error::Error, "Failed to reconcile deployment");
        self.events
            .publish(EventType::Warning, reason, error_chain_message(&error))
            .await;
        error
    }
}
