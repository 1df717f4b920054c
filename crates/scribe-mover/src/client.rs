//! Kubernetes access for the mover pipeline
//!
//! Every read and write a reconcile pass makes goes through
//! [`MoverKubeClient`], so the pipeline can be exercised against mocks. The
//! real implementation server-side applies desired state under the
//! controller's field manager and deletes with background propagation.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service, ServiceAccount};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use scribe_common::crd::{ReplicationSource, ReplicationSourceStatus};
use scribe_common::error::is_not_found;
use scribe_common::kube_utils::HasApiResource;
use scribe_common::volume_snapshot::VolumeSnapshot;
use scribe_common::{Error, FIELD_MANAGER};

// =============================================================================
// Trait for dependency injection and testability
// =============================================================================

/// Namespaced Kubernetes operations needed by the movers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MoverKubeClient: Send + Sync {
    /// Get a Job
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// Apply a Job and return the stored object, including its status
    async fn apply_job(&self, namespace: &str, job: &Job) -> Result<Job, Error>;

    /// Delete a Job and, in the background, its pods. Missing is not an error.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a PersistentVolumeClaim
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Apply a PersistentVolumeClaim
    async fn apply_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// Delete a PersistentVolumeClaim. Missing is not an error.
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Apply a VolumeSnapshot and return it with its current status
    async fn apply_volume_snapshot(
        &self,
        namespace: &str,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot, Error>;

    /// Delete a VolumeSnapshot. Missing is not an error.
    async fn delete_volume_snapshot(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Apply a ServiceAccount
    async fn apply_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), Error>;

    /// Apply a Service and return it with its current status
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret unless one with that name already exists
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Apply a Secret
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Replace the status of a ReplicationSource.
    ///
    /// With a `resource_version` the write fails with 409 Conflict if the
    /// object changed since it was read.
    async fn patch_source_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &ReplicationSourceStatus,
    ) -> Result<(), Error>;
}

// =============================================================================
// Real implementation
// =============================================================================

/// [`MoverKubeClient`] backed by a kube-rs client
#[derive(Clone)]
pub struct MoverKubeClientImpl {
    client: Client,
}

impl MoverKubeClientImpl {
    /// Wrap a kube-rs client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    async fn apply<K>(&self, namespace: &str, object: &K) -> Result<K, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + Serialize
            + DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let name = object.name_any();
        let applied = api
            .patch(&name, &Self::apply_params(), &Patch::Apply(object))
            .await?;
        debug!(kind = %K::kind(&Default::default()), name = %name, "applied");
        Ok(applied)
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(kind = %K::kind(&Default::default()), name = %name, "deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    fn snapshot_api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            namespace,
            &VolumeSnapshot::api_resource(),
        )
    }
}

#[async_trait]
impl MoverKubeClient for MoverKubeClientImpl {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        self.get(namespace, name).await
    }

    async fn apply_job(&self, namespace: &str, job: &Job) -> Result<Job, Error> {
        self.apply(namespace, job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete::<Job>(namespace, name).await
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        self.get(namespace, name).await
    }

    async fn apply_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        self.apply(namespace, pvc).await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete::<PersistentVolumeClaim>(namespace, name).await
    }

    async fn apply_volume_snapshot(
        &self,
        namespace: &str,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot, Error> {
        let body = serde_json::to_value(snapshot)
            .map_err(|e| Error::serialization_for_kind(VolumeSnapshot::KIND, e.to_string()))?;
        let applied = self
            .snapshot_api(namespace)
            .patch(
                &snapshot.metadata.name,
                &Self::apply_params(),
                &Patch::Apply(&body),
            )
            .await?;
        let value = serde_json::to_value(applied)
            .map_err(|e| Error::serialization_for_kind(VolumeSnapshot::KIND, e.to_string()))?;
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(VolumeSnapshot::KIND, e.to_string()))
    }

    async fn delete_volume_snapshot(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .snapshot_api(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), Error> {
        self.apply(namespace, service_account).await.map(|_| ())
    }

    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        self.apply(namespace, service).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        self.get(namespace, name).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        self.apply(namespace, secret).await.map(|_| ())
    }

    async fn patch_source_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &ReplicationSourceStatus,
    ) -> Result<(), Error> {
        let api: Api<ReplicationSource> = Api::namespaced(self.client.clone(), namespace);
        let patch = status_patch(resource_version, status);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Merge patch body replacing the status, guarded by `resourceVersion` when given
fn status_patch(
    resource_version: Option<String>,
    status: &ReplicationSourceStatus,
) -> serde_json::Value {
    match resource_version {
        Some(rv) => serde_json::json!({
            "metadata": { "resourceVersion": rv },
            "status": status,
        }),
        None => serde_json::json!({ "status": status }),
    }
}
