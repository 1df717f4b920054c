//! Mover Job lifecycle
//!
//! One Job per ReplicationSource and method, applied idempotently on every
//! pass. The Job's status is written by the Job controller, not by us, so
//! after each apply the returned status decides what happens next:
//!
//! - `failed >= BACKOFF_LIMIT`: delete the Job so the next pass starts a fresh one
//! - `succeeded >= 1`: the sync is done
//! - otherwise: still running (or paused), check again later
//!
//! A Job's pod template is immutable, so a Job that already exists keeps the
//! template it was created with until it finishes or is discarded. Only the
//! mutable fields, such as parallelism for pausing, follow the request. Any
//! rejected apply is returned to the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, SecretKeySelector, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use scribe_common::crd::ReplicationSource;
use scribe_common::kube_utils::owned_meta;
use scribe_common::Error;

use crate::client::MoverKubeClient;

/// Failed pods tolerated before the Job is discarded and recreated
pub const BACKOFF_LIMIT: i32 = 2;

/// Where the data volume is mounted in every mover container
pub const DATA_MOUNT_PATH: &str = "/data";

/// Volume name of the data volume
pub const DATA_VOLUME_NAME: &str = "data";

/// Desired state of a mover Job
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobRequest {
    /// Job name
    pub name: String,
    /// Labels on the pod template
    pub pod_labels: BTreeMap<String, String>,
    /// Mover containers
    pub containers: Vec<Container>,
    /// Pod volumes
    pub volumes: Vec<Volume>,
    /// ServiceAccount the pod runs as
    pub service_account: String,
    /// Run no pods while keeping the Job object
    pub paused: bool,
}

/// What the Job controller reports for the applied Job
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    /// Not finished yet (or paused)
    Running,
    /// Deleted for a fresh retry (backoff exhausted or template changed)
    Recreating,
    /// Completed successfully
    Succeeded {
        /// When the Job started, if reported
        start_time: Option<DateTime<Utc>>,
        /// The pod template the Job actually ran
        template: Box<PodTemplateSpec>,
    },
}

/// Build the Job object for a request
pub fn build_job(source: &ReplicationSource, request: &JobRequest) -> Result<Job, Error> {
    Ok(Job {
        metadata: owned_meta(&request.name, source)?,
        spec: Some(JobSpec {
            backoff_limit: Some(BACKOFF_LIMIT),
            parallelism: Some(if request.paused { 0 } else { 1 }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: (!request.pod_labels.is_empty()).then(|| request.pod_labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: request.containers.clone(),
                    volumes: Some(request.volumes.clone()),
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(request.service_account.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The "ensure compute job" step.
///
/// The backoff check runs on every call regardless of whether the apply
/// changed anything, since the status is updated asynchronously.
pub async fn ensure_job(
    client: &dyn MoverKubeClient,
    source: &ReplicationSource,
    request: &JobRequest,
) -> Result<JobOutcome, Error> {
    let namespace = source.namespace().unwrap_or_default();
    let mut job = build_job(source, request)?;
    if let Some(existing) = client.get_job(&namespace, &request.name).await? {
        if let (Some(desired), Some(current)) = (job.spec.as_mut(), existing.spec) {
            if desired.template != current.template {
                debug!(job = %request.name, "keeping the template of the existing job");
            }
            desired.template = current.template;
        }
    }

    let applied = client.apply_job(&namespace, &job).await?;
    let template = applied.spec.map(|spec| spec.template).unwrap_or_default();
    let status = applied.status.unwrap_or_default();

    if status.failed.unwrap_or(0) >= BACKOFF_LIMIT {
        warn!(job = %request.name, failed = ?status.failed, "backoff limit reached, deleting job");
        client.delete_job(&namespace, &request.name).await?;
        return Ok(JobOutcome::Recreating);
    }

    if status.succeeded.unwrap_or(0) >= 1 {
        info!(job = %request.name, "job completed");
        return Ok(JobOutcome::Succeeded {
            start_time: status.start_time.map(|t| t.0),
            template: Box::new(template),
        });
    }

    debug!(job = %request.name, paused = request.paused, "job not finished");
    Ok(JobOutcome::Running)
}

/// Delete a finished Job and its pods
pub async fn cleanup_job(
    client: &dyn MoverKubeClient,
    source: &ReplicationSource,
    name: &str,
) -> Result<(), Error> {
    let namespace = source.namespace().unwrap_or_default();
    client.delete_job(&namespace, name).await?;
    info!(job = %name, "job deleted");
    Ok(())
}

// =============================================================================
// Pod spec building blocks
// =============================================================================

/// Plain environment variable
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment variable taken from the same-named key of a secret
pub fn env_from_secret(secret: &str, key: &str, optional: bool) -> EnvVar {
    EnvVar {
        name: key.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(optional),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Mount a pod volume
pub fn mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Pod volume backed by a PVC
pub fn pvc_volume(volume: &str, claim: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod volume backed by a secret, files readable only by the owner
pub fn secret_volume(volume: &str, secret: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            default_mode: Some(0o600),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Movers run as root to preserve ownership of the files they copy
pub fn root_security_context(add_capabilities: &[&str]) -> SecurityContext {
    SecurityContext {
        run_as_user: Some(0),
        capabilities: (!add_capabilities.is_empty()).then(|| Capabilities {
            add: Some(add_capabilities.iter().map(|c| c.to_string()).collect()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
