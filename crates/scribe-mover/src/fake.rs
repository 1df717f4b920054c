//! In-memory [`MoverKubeClient`] for multi-pass reconcile stories
//!
//! Stores every applied object by namespace and name. Jobs come back with
//! whatever status the test has set through [`FakeKubeClient::finish_job`]
//! or [`FakeKubeClient::fail_job`], the way the Job controller would report it,
//! and reject a changed pod template the way the API server does.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use scribe_common::crd::ReplicationSourceStatus;
use scribe_common::volume_snapshot::VolumeSnapshot;
use scribe_common::Error;

use crate::client::MoverKubeClient;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub jobs: BTreeMap<Key, Job>,
    pub job_statuses: BTreeMap<Key, JobStatus>,
    pub deleted_jobs: Vec<String>,
    pub pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    pub snapshots: BTreeMap<Key, VolumeSnapshot>,
    pub service_accounts: BTreeMap<Key, ServiceAccount>,
    pub services: BTreeMap<Key, Service>,
    pub secrets: BTreeMap<Key, Secret>,
    pub statuses: Vec<ReplicationSourceStatus>,
}

#[derive(Default)]
pub(crate) struct FakeKubeClient {
    pub state: Mutex<FakeState>,
}

impl FakeKubeClient {
    /// Seed an object the user created, such as the source PVC
    pub fn with_pvc(self, namespace: &str, pvc: PersistentVolumeClaim) -> Self {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().pvcs.insert(key(namespace, &name), pvc);
        self
    }

    pub fn with_secret(self, namespace: &str, secret: Secret) -> Self {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(key(namespace, &name), secret);
        self
    }

    /// Report the Job as completed
    pub fn finish_job(&self, namespace: &str, name: &str, started: DateTime<Utc>) {
        self.state.lock().unwrap().job_statuses.insert(
            key(namespace, name),
            JobStatus {
                succeeded: Some(1),
                start_time: Some(Time(started)),
                ..Default::default()
            },
        );
    }

    /// Report failed pods for the Job
    pub fn fail_job(&self, namespace: &str, name: &str, failed: i32) {
        self.state.lock().unwrap().job_statuses.insert(
            key(namespace, name),
            JobStatus {
                failed: Some(failed),
                ..Default::default()
            },
        );
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.state.lock().unwrap().jobs.get(&key(namespace, name)).cloned()
    }

    pub fn has_job(&self, namespace: &str, name: &str) -> bool {
        self.state.lock().unwrap().jobs.contains_key(&key(namespace, name))
    }

    pub fn last_status(&self) -> Option<ReplicationSourceStatus> {
        self.state.lock().unwrap().statuses.last().cloned()
    }
}

/// The API server's answer to a changed Job pod template
fn template_immutable(name: &str) -> Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!(
            "Job.batch \"{}\" is invalid: spec.template: Invalid value: field is immutable",
            name
        ),
        reason: "Invalid".to_string(),
        code: 422,
    })
    .into()
}

#[async_trait]
impl MoverKubeClient for FakeKubeClient {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(&key(namespace, name)).map(|job| {
            let mut job = job.clone();
            job.status = state.job_statuses.get(&key(namespace, name)).cloned();
            job
        }))
    }

    async fn apply_job(&self, namespace: &str, job: &Job) -> Result<Job, Error> {
        let name = job.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.jobs.get(&key(namespace, &name)) {
            let template = |job: &Job| job.spec.as_ref().map(|spec| spec.template.clone());
            if template(existing) != template(job) {
                return Err(template_immutable(&name));
            }
        }
        let mut stored = job.clone();
        stored.status = state.job_statuses.get(&key(namespace, &name)).cloned();
        state.jobs.insert(key(namespace, &name), stored.clone());
        Ok(stored)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.remove(&key(namespace, name)).is_some() {
            state.deleted_jobs.push(name.to_string());
        }
        state.job_statuses.remove(&key(namespace, name));
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(self.state.lock().unwrap().pvcs.get(&key(namespace, name)).cloned())
    }

    async fn apply_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .pvcs
            .insert(key(namespace, &name), pvc.clone());
        Ok(pvc.clone())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.state.lock().unwrap().pvcs.remove(&key(namespace, name));
        Ok(())
    }

    async fn apply_volume_snapshot(
        &self,
        namespace: &str,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot, Error> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .snapshots
            .entry(key(namespace, &snapshot.metadata.name))
            .or_insert_with(|| snapshot.clone());
        Ok(stored.clone())
    }

    async fn delete_volume_snapshot(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .remove(&key(namespace, name));
        Ok(())
    }

    async fn apply_service_account(
        &self,
        namespace: &str,
        service_account: &ServiceAccount,
    ) -> Result<(), Error> {
        let name = service_account.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .service_accounts
            .insert(key(namespace, &name), service_account.clone());
        Ok(())
    }

    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut stored = service.clone();
        if let Some(spec) = stored.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.10".to_string());
        }
        self.state
            .lock()
            .unwrap()
            .services
            .insert(key(namespace, &name), stored.clone());
        Ok(stored)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .secrets
            .entry(key(namespace, &name))
            .or_insert_with(|| secret.clone());
        Ok(())
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(key(namespace, &name), secret.clone());
        Ok(())
    }

    async fn patch_source_status(
        &self,
        _namespace: &str,
        _name: &str,
        _resource_version: Option<String>,
        status: &ReplicationSourceStatus,
    ) -> Result<(), Error> {
        self.state.lock().unwrap().statuses.push(status.clone());
        Ok(())
    }
}
