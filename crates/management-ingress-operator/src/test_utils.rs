//! In-memory doubles for the store and the event sink.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use k8s_openapi::{
    api::apps::v1::{Deployment, DeploymentStatus},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{ResourceExt, runtime::events::EventType};

use crate::{
    client::{DeploymentStore, StoreError},
    crd::{ManagementIngress, ManagementIngressSpec},
    deployment::WorkloadConfig,
};

pub fn workload_config(image: &str) -> WorkloadConfig {
    WorkloadConfig {
        image: image.to_string(),
        ..WorkloadConfig::default()
    }
}

pub fn owner(namespace: &str, name: &str) -> ManagementIngress {
    let mut owner = ManagementIngress::new(name, ManagementIngressSpec {
        image_repo: "repo/img:v1".to_string(),
        iam_namespace: "ibm-common-services".to_string(),
        ..ManagementIngressSpec::default()
    });
    owner.metadata.namespace = Some(namespace.to_string());
    owner.metadata.uid = Some("8c4b0a6e-1f43-4a8e-9d0c-7b7a3f2f9e11".to_string());
    owner
}

pub fn deployment_with_status(name: &str, replicas: i32, ready_replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        status: Some(DeploymentStatus {
            replicas: Some(replicas),
            ready_replicas: Some(ready_replicas),
            ..DeploymentStatus::default()
        }),
        ..Deployment::default()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub create: usize,
    pub get: usize,
    pub update: usize,
    pub delete: usize,
    pub list: usize,
}

/// A [`DeploymentStore`] that keeps objects in memory and checks `resourceVersion`s on update
/// like the API server does.
///
/// Results of `get`, `create` and `update` can be scripted to simulate failures.
#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<(String, String), Deployment>>,
    next_resource_version: Mutex<u64>,
    scripted_gets: Mutex<VecDeque<Result<Deployment, StoreError>>>,
    default_get: Mutex<Option<Deployment>>,
    create_failure: Mutex<Option<StoreError>>,
    update_failure: Mutex<Option<StoreError>>,
    submitted: Mutex<Vec<Deployment>>,
    calls: Mutex<StoreCalls>,
}

impl InMemoryStore {
    /// Queues the result of a future `get` call. Queued results are used before stored objects.
    pub fn push_get(&self, result: Result<Deployment, StoreError>) {
        self.scripted_gets.lock().unwrap().push_back(result);
    }

    /// Returns `deployment` for every `get` that has no queued result.
    pub fn set_default_get(&self, deployment: Deployment) {
        *self.default_get.lock().unwrap() = Some(deployment);
    }

    pub fn fail_next_create(&self, error: StoreError) {
        *self.create_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_next_update(&self, error: StoreError) {
        *self.update_failure.lock().unwrap() = Some(error);
    }

    /// Inserts an object as if it was created by someone else.
    pub fn insert(&self, mut deployment: Deployment) -> Deployment {
        deployment.metadata.resource_version = Some(self.bump_resource_version());
        deployment.metadata.uid = Some(format!("uid-{}", deployment.name_any()));
        self.objects
            .lock()
            .unwrap()
            .insert(key_of(&deployment), deployment.clone());
        deployment
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every object passed to `create` or `update`, in call order.
    pub fn submitted(&self) -> Vec<Deployment> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn calls(&self) -> StoreCalls {
        *self.calls.lock().unwrap()
    }

    pub fn get_calls(&self) -> usize {
        self.calls().get
    }

    fn bump_resource_version(&self) -> String {
        let mut version = self.next_resource_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }
}

fn key_of(deployment: &Deployment) -> (String, String) {
    (
        deployment.namespace().unwrap_or_default(),
        deployment.name_any(),
    )
}

#[async_trait]
impl DeploymentStore for InMemoryStore {
    async fn create(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.calls.lock().unwrap().create += 1;
        self.submitted.lock().unwrap().push(deployment.clone());
        if let Some(error) = self.create_failure.lock().unwrap().take() {
            return Err(error);
        }
        if self.objects.lock().unwrap().contains_key(&key_of(deployment)) {
            return Err(StoreError::AlreadyExists {
                name: deployment.name_any(),
            });
        }
        Ok(self.insert(deployment.clone()))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        self.calls.lock().unwrap().get += 1;
        if let Some(result) = self.scripted_gets.lock().unwrap().pop_front() {
            return result;
        }
        if let Some(deployment) = self.default_get.lock().unwrap().clone() {
            return Ok(deployment);
        }
        self.stored(namespace, name).ok_or_else(|| StoreError::NotFound {
            name: name.to_string(),
        })
    }

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.calls.lock().unwrap().update += 1;
        self.submitted.lock().unwrap().push(deployment.clone());
        if let Some(error) = self.update_failure.lock().unwrap().take() {
            return Err(error);
        }

        let name = deployment.name_any();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get(&key_of(deployment))
            .ok_or_else(|| StoreError::NotFound { name: name.clone() })?;
        if stored.metadata.resource_version != deployment.metadata.resource_version {
            return Err(StoreError::Conflict {
                name,
                message: "the object has been modified".to_string(),
            });
        }

        let mut updated = deployment.clone();
        updated.metadata.resource_version = Some(self.bump_resource_version());
        objects.insert(key_of(&updated), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.calls.lock().unwrap().delete += 1;
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>, StoreError> {
        self.calls.lock().unwrap().list += 1;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|deployment| deployment.namespace().as_deref() == Some(namespace))
            .filter(|deployment| {
                let labels = deployment.labels();
                selector
                    .iter()
                    .all(|(key, value)| labels.get(key) == Some(value))
            })
            .cloned()
            .collect())
    }
}

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub type_: EventType,
    pub reason: String,
    pub note: String,
}

impl RecordedEvent {
    pub fn is_warning(&self) -> bool {
        matches!(self.type_, EventType::Warning)
    }
}

/// An [`EventPublisher`](crate::event::EventPublisher) that remembers every event.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::event::EventPublisher for RecordingEventPublisher {
    async fn publish(&self, type_: EventType, reason: &str, note: String) {
        self.events.lock().unwrap().push(RecordedEvent {
            type_,
            reason: reason.to_string(),
            note,
        });
    }
}
