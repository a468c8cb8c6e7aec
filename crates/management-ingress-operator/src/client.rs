//! Access to the Kubernetes API.
//!
//! The reconciliation logic only talks to the store through the [`DeploymentStore`] trait, so
//! that it can be exercised without an API server. [`Client`] is the implementation backed by
//! [`kube::Api`].
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{NamespaceResourceScope, api::apps::v1::Deployment};
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, ListParams, PostParams},
    client::Client as KubeClient,
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, Snafu};
use strum::EnumDiscriminants;

/// Error returned by [`DeploymentStore`] operations.
///
/// The variants mirror the Kubernetes status reasons the reconciler has to tell apart.
#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(name(StoreErrorKind), derive(strum::IntoStaticStr, strum::Display))]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("object {name:?} was not found"))]
    NotFound { name: String },

    #[snafu(display("object {name:?} already exists"))]
    AlreadyExists { name: String },

    #[snafu(display("object {name:?} was modified concurrently: {message}"))]
    Conflict { name: String, message: String },

    #[snafu(display("object {name:?} was rejected by the API server: {message}"))]
    Invalid { name: String, message: String },

    #[snafu(display("request for object {name:?} failed"))]
    Transient {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("object has no name"))]
    MissingName,
}

impl StoreError {
    /// Classifies a [`kube::Error`] by the status code and reason of the API response.
    pub fn from_kube(name: &str, error: kube::Error) -> Self {
        if let kube::Error::Api(response) = &error {
            if let Some(classified) =
                Self::from_status(name, response.code, &response.reason, &response.message)
            {
                return classified;
            }
        }
        Self::Transient {
            name: name.to_owned(),
            source: Box::new(error),
        }
    }

    /// Maps an API status to the kind the reconciler reacts to, [`None`] means transient.
    fn from_status(name: &str, code: u16, reason: &str, message: &str) -> Option<Self> {
        let name = name.to_owned();
        let message = message.to_owned();
        match (code, reason) {
            (404, _) => Some(Self::NotFound { name }),
            (409, "AlreadyExists") => Some(Self::AlreadyExists { name }),
            (409, _) => Some(Self::Conflict { name, message }),
            (400 | 422, _) => Some(Self::Invalid { name, message }),
            _ => None,
        }
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.into()
    }
}

/// The subset of the Kubernetes API the deployment reconciler needs.
///
/// All calls address objects in a single namespace.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Creates a new deployment, fails with [`StoreError::AlreadyExists`] if one with the same
    /// name exists.
    async fn create(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError>;

    /// Replaces a deployment. The `resourceVersion` of `deployment` is checked by the API
    /// server, a stale one fails with [`StoreError::Conflict`].
    async fn update(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>, StoreError>;
}

/// This `Client` can be used to access Kubernetes.
/// It wraps an underlying [`kube::client::Client`] and provides some common functionality.
#[derive(Clone)]
pub struct Client {
    client: KubeClient,
    post_params: PostParams,
    delete_params: DeleteParams,
}

impl Client {
    pub fn new(client: KubeClient, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager,
                ..PostParams::default()
            },
            delete_params: DeleteParams::default(),
        }
    }

    /// Returns a [`kube::client::Client`] that can be freely used.
    /// It does not need to be cloned before first use.
    pub fn as_kube_client(&self) -> KubeClient {
        self.client.clone()
    }

    /// Retrieves a single instance of the requested resource type with the given name.
    pub async fn get<T>(&self, resource_name: &str, namespace: &str) -> Result<T, StoreError>
    where
        T: Clone + std::fmt::Debug + DeserializeOwned + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.get_api::<T>(namespace)
            .get(resource_name)
            .await
            .map_err(|error| StoreError::from_kube(resource_name, error))
    }

    async fn create_namespaced<T>(&self, resource: &T) -> Result<T, StoreError>
    where
        T: Clone
            + std::fmt::Debug
            + Serialize
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let name = resource.meta().name.as_deref().context(MissingNameSnafu)?;
        self.get_api::<T>(&resource.namespace().unwrap_or_default())
            .create(&self.post_params, resource)
            .await
            .map_err(|error| StoreError::from_kube(name, error))
    }

    async fn replace_namespaced<T>(&self, resource: &T) -> Result<T, StoreError>
    where
        T: Clone
            + std::fmt::Debug
            + Serialize
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let name = resource.meta().name.as_deref().context(MissingNameSnafu)?;
        self.get_api::<T>(&resource.namespace().unwrap_or_default())
            .replace(name, &self.post_params, resource)
            .await
            .map_err(|error| StoreError::from_kube(name, error))
    }

    /// Returns an [`kube::Api`] object for the given namespace.
    pub fn get_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn get_all_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl DeploymentStore for Client {
    async fn create(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.create_namespaced(deployment).await
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        Client::get(self, name, namespace).await
    }

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.replace_namespaced(deployment).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        // Deployments return the object while it is being deleted, which we don't care about
        self.get_api::<Deployment>(namespace)
            .delete(name, &self.delete_params)
            .await
            .map(|_| ())
            .map_err(|error| StoreError::from_kube(name, error))
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>, StoreError> {
        let list_params = ListParams::default().labels(&label_selector_query(selector));
        self.get_api::<Deployment>(namespace)
            .list(&list_params)
            .await
            .map(|list| list.items)
            .map_err(|error| StoreError::from_kube(namespace, error))
    }
}

/// Renders match labels as a label selector query, e.g. `app=foo,component=bar`.
pub fn label_selector_query(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
