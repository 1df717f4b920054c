//! Mover reconcilers
//!
//! The populated method block selects one of a closed set of movers. Each
//! mover has a fixed step table; the steps every mover shares (scheduling,
//! data volume, service account, job lifecycle, cleanup) are implemented once
//! on [`SyncPass`], and each mover supplies its own provisioning steps and
//! the Job it runs.

pub mod rclone;
pub mod restic;
pub mod rsync;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PodTemplateSpec, ServiceAccount};
use kube::ResourceExt;
use tracing::{debug, info};

use scribe_common::crd::{
    ReplicationSource, ReplicationSourceSpec, ReplicationSourceStatus,
    ReplicationSourceVolumeOptions,
};
use scribe_common::kube_utils::{format_duration, owned_meta};
use scribe_common::Error;

use crate::client::MoverKubeClient;
use crate::config::MoverImages;
use crate::job::{self, JobOutcome, JobRequest};
use crate::pipeline::{run_steps, StepRunner};
use crate::schedule::{self, SyncRecorder};
use crate::volume;

pub use rclone::RcloneMover;
pub use restic::ResticMover;
pub use rsync::RsyncMover;

// =============================================================================
// Steps
// =============================================================================

/// Every step a mover pipeline can contain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MoverStep {
    /// Decide whether a sync is due
    AwaitNextSync,
    /// Check the method block for required fields
    Validate,
    /// Resolve (or copy) the volume to sync
    EnsureDataVolume,
    /// rsync: expose the mover through a Service
    EnsureService,
    /// rsync: publish the Service address to status
    PublishAddress,
    /// rsync: validate or generate ssh keys
    EnsureKeys,
    /// ServiceAccount the mover pod runs as
    EnsureServiceAccount,
    /// rclone: validate the config secret
    EnsureConfig,
    /// restic: cache PVC
    EnsureCache,
    /// restic: validate the repository secret
    EnsureRepository,
    /// Apply the Job and wait for it to finish
    EnsureJob,
    /// Record the completed sync and delete the Job
    CleanupJob,
    /// Release the point-in-time copy
    CleanupVolume,
}

impl fmt::Display for MoverStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitNextSync => "await-next-sync",
            Self::Validate => "validate",
            Self::EnsureDataVolume => "ensure-data-volume",
            Self::EnsureService => "ensure-service",
            Self::PublishAddress => "publish-address",
            Self::EnsureKeys => "ensure-keys",
            Self::EnsureServiceAccount => "ensure-service-account",
            Self::EnsureConfig => "ensure-config",
            Self::EnsureCache => "ensure-cache",
            Self::EnsureRepository => "ensure-repository",
            Self::EnsureJob => "ensure-job",
            Self::CleanupJob => "cleanup-job",
            Self::CleanupVolume => "cleanup-volume",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Method selection
// =============================================================================

/// The replication method a ReplicationSource asks for
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Method<'a> {
    /// rsync over ssh
    Rsync(&'a scribe_common::crd::ReplicationSourceRsyncSpec),
    /// rclone to an object store
    Rclone(&'a scribe_common::crd::ReplicationSourceRcloneSpec),
    /// restic backup
    Restic(&'a scribe_common::crd::ReplicationSourceResticSpec),
    /// Handled by another controller
    External,
    /// No method block populated
    Unconfigured,
}

impl<'a> Method<'a> {
    /// Pick the single populated method block.
    ///
    /// More than one is a configuration error.
    pub fn select(source_name: &str, spec: &'a ReplicationSourceSpec) -> Result<Self, Error> {
        let configured = spec.configured_methods();
        if configured.len() > 1 {
            return Err(Error::configuration_for(
                source_name,
                "only a single replication method can be provided",
            ));
        }

        Ok(match (&spec.rsync, &spec.rclone, &spec.restic, &spec.external) {
            (Some(rsync), _, _, _) => Method::Rsync(rsync),
            (_, Some(rclone), _, _) => Method::Rclone(rclone),
            (_, _, Some(restic), _) => Method::Restic(restic),
            (_, _, _, Some(_)) => Method::External,
            _ => Method::Unconfigured,
        })
    }
}

/// A mover with its per-pass state
pub enum Mover<'a> {
    /// rsync mover
    Rsync(RsyncMover<'a>),
    /// rclone mover
    Rclone(RcloneMover<'a>),
    /// restic mover
    Restic(ResticMover<'a>),
}

impl<'a> Mover<'a> {
    /// The mover for a method, if this controller runs one
    pub fn for_method(method: Method<'a>) -> Option<Self> {
        match method {
            Method::Rsync(spec) => Some(Mover::Rsync(RsyncMover::new(spec))),
            Method::Rclone(spec) => Some(Mover::Rclone(RcloneMover::new(spec))),
            Method::Restic(spec) => Some(Mover::Restic(ResticMover::new(spec))),
            Method::External | Method::Unconfigured => None,
        }
    }

    /// Method name used in labels and logs
    pub fn method(&self) -> &'static str {
        match self {
            Mover::Rsync(_) => "rsync",
            Mover::Rclone(_) => "rclone",
            Mover::Restic(_) => "restic",
        }
    }

    /// The mover's step table
    pub fn steps(&self) -> &'static [MoverStep] {
        match self {
            Mover::Rsync(_) => rsync::STEPS,
            Mover::Rclone(_) => rclone::STEPS,
            Mover::Restic(_) => restic::STEPS,
        }
    }

    fn volume_options(&self) -> &'a ReplicationSourceVolumeOptions {
        match self {
            Mover::Rsync(m) => &m.spec.volume,
            Mover::Rclone(m) => &m.spec.volume,
            Mover::Restic(m) => &m.spec.volume,
        }
    }

    /// Name of the Job this mover runs for a source
    pub fn job_name(&self, source_name: &str) -> String {
        format!("scribe-{}-src-{}", self.method(), source_name)
    }

    async fn run_own_step(&mut self, pass: &mut SyncPass<'_>, step: MoverStep) -> Result<bool, Error> {
        match self {
            Mover::Rsync(m) => m.run_step(pass, step).await,
            Mover::Rclone(m) => m.run_step(pass, step).await,
            Mover::Restic(m) => m.run_step(pass, step).await,
        }
    }

    fn job_request(&self, pass: &SyncPass<'_>, data_volume: &str) -> Result<JobRequest, Error> {
        let mut request = match self {
            Mover::Rsync(m) => m.job_request(pass, data_volume)?,
            Mover::Rclone(m) => m.job_request(pass, data_volume)?,
            Mover::Restic(m) => m.job_request(pass, data_volume)?,
        };
        request.name = self.job_name(&pass.name);
        request.service_account = service_account_name(&pass.name);
        request.paused = pass.source.spec.paused;
        Ok(request)
    }

    fn on_job_succeeded(&mut self, pass: &mut SyncPass<'_>, template: &PodTemplateSpec) {
        if let Mover::Restic(m) = self {
            m.on_job_succeeded(pass, template);
        }
    }
}

/// Name of the ServiceAccount mover pods run as
pub fn service_account_name(source_name: &str) -> String {
    format!("scribe-src-{}", source_name)
}

/// Configuration error for a missing required field of a method block
pub(crate) fn require_field<'s>(
    source_name: &str,
    field: &str,
    value: Option<&'s str>,
    message: &str,
) -> Result<&'s str, Error> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::configuration_for_field(source_name, field, message))
}

// =============================================================================
// Per-pass state
// =============================================================================

/// Everything a single reconcile pass reads and writes
pub struct SyncPass<'a> {
    /// Kubernetes access
    pub client: &'a dyn MoverKubeClient,
    /// The object being reconciled
    pub source: &'a ReplicationSource,
    /// Mover images
    pub images: &'a MoverImages,
    /// Metrics for this object
    pub metrics: &'a dyn SyncRecorder,
    /// Time the pass started
    pub now: DateTime<Utc>,
    /// Source name
    pub name: String,
    /// Source namespace
    pub namespace: String,
    /// Working copy of the status, written back after the pass
    pub status: ReplicationSourceStatus,
    data_volume: Option<String>,
    job_started: Option<DateTime<Utc>>,
}

impl<'a> SyncPass<'a> {
    /// Start a pass from the object's current status
    pub fn new(
        client: &'a dyn MoverKubeClient,
        source: &'a ReplicationSource,
        images: &'a MoverImages,
        metrics: &'a dyn SyncRecorder,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client,
            source,
            images,
            metrics,
            now,
            name: source.name_any(),
            namespace: source.namespace().unwrap_or_default(),
            status: source.status.clone().unwrap_or_default(),
            data_volume: None,
            job_started: None,
        }
    }

    async fn ensure_data_volume(
        &mut self,
        options: &ReplicationSourceVolumeOptions,
    ) -> Result<bool, Error> {
        let volume = volume::ensure_data_volume(self.client, self.source, options).await?;
        let ready = volume.is_some();
        self.data_volume = volume;
        Ok(ready)
    }

    async fn ensure_service_account(&mut self) -> Result<bool, Error> {
        let service_account = ServiceAccount {
            metadata: owned_meta(service_account_name(&self.name), self.source)?,
            ..Default::default()
        };
        self.client
            .apply_service_account(&self.namespace, &service_account)
            .await?;
        Ok(true)
    }

    async fn cleanup_job(&mut self, job_name: &str) -> Result<bool, Error> {
        schedule::record_sync_completed(self.source, &mut self.status, self.metrics, self.now)?;
        if let Some(started) = self.job_started {
            let duration = self.now - started;
            self.status.last_sync_duration = Some(format_duration(duration));
            self.metrics
                .observe_sync_duration(duration.num_milliseconds() as f64 / 1000.0);
        }
        job::cleanup_job(self.client, self.source, job_name).await?;
        Ok(true)
    }
}

/// Runs one mover's steps against a pass
pub struct MoverRun<'a> {
    /// Shared per-pass state
    pub pass: SyncPass<'a>,
    /// The selected mover
    pub mover: Mover<'a>,
}

#[async_trait]
impl<'a> StepRunner<MoverStep> for MoverRun<'a> {
    async fn run_step(&mut self, step: MoverStep) -> Result<bool, Error> {
        let pass = &mut self.pass;
        match step {
            MoverStep::AwaitNextSync => {
                schedule::should_sync_now(pass.source, &mut pass.status, pass.metrics, pass.now)
            }
            MoverStep::EnsureDataVolume => {
                let options = self.mover.volume_options();
                pass.ensure_data_volume(options).await
            }
            MoverStep::EnsureServiceAccount => pass.ensure_service_account().await,
            MoverStep::EnsureJob => {
                let data_volume = pass.data_volume.clone().ok_or_else(|| {
                    Error::internal_with_context("ensure-job", "data volume not resolved")
                })?;
                let request = self.mover.job_request(pass, &data_volume)?;
                match job::ensure_job(pass.client, pass.source, &request).await? {
                    JobOutcome::Succeeded {
                        start_time,
                        template,
                    } => {
                        pass.job_started = start_time;
                        self.mover.on_job_succeeded(pass, &template);
                        Ok(true)
                    }
                    JobOutcome::Running | JobOutcome::Recreating => Ok(false),
                }
            }
            MoverStep::CleanupJob => {
                let job_name = self.mover.job_name(&pass.name);
                pass.cleanup_job(&job_name).await
            }
            MoverStep::CleanupVolume => {
                let options = self.mover.volume_options();
                volume::cleanup_data_volume(pass.client, pass.source, options).await?;
                Ok(true)
            }
            own => self.mover.run_own_step(pass, own).await,
        }
    }
}

impl<'a> MoverRun<'a> {
    /// Run the mover's full step table, returning the final status.
    ///
    /// The status is returned even when a step fails so the caller can
    /// persist whatever the pass learned alongside the error.
    pub async fn execute(mut self) -> (ReplicationSourceStatus, Result<bool, Error>) {
        let steps = self.mover.steps();
        info!(source = %self.pass.name, method = self.mover.method(), "running mover");
        let result = run_steps(&mut self, steps).await;
        debug!(source = %self.pass.name, ?result, "mover pass finished");
        (self.pass.status, result)
    }
}
