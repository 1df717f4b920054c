//! restic backup into a repository
//!
//! Each sync runs `backup`, followed by `prune` once every
//! `pruneIntervalDays`. Repository location and credentials are passed
//! through from the repository secret key-for-key as environment variables.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use tracing::{debug, info};

use scribe_common::crd::{
    ReplicationSourceResticSpec, ReplicationSourceResticStatus, ReplicationSourceStatus,
    ResticRetainPolicy,
};
use scribe_common::kube_utils::validate_secret_keys;
use scribe_common::Error;

use super::{MoverStep, SyncPass};
use crate::job::{
    env, env_from_secret, mount, pvc_volume, root_security_context, JobRequest, DATA_MOUNT_PATH,
    DATA_VOLUME_NAME,
};
use crate::volume::{owned_claim, ClaimShape};

/// restic step table
pub const STEPS: &[MoverStep] = &[
    MoverStep::AwaitNextSync,
    MoverStep::Validate,
    MoverStep::EnsureDataVolume,
    MoverStep::EnsureCache,
    MoverStep::EnsureServiceAccount,
    MoverStep::EnsureRepository,
    MoverStep::EnsureJob,
    MoverStep::CleanupJob,
    MoverStep::CleanupVolume,
];

/// Keys the repository secret must carry
pub const REQUIRED_REPOSITORY_KEYS: &[&str] = &["RESTIC_REPOSITORY", "RESTIC_PASSWORD"];

/// Backend credentials passed through when present in the repository secret
pub const OPTIONAL_REPOSITORY_KEYS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_DEFAULT_REGION",
    "ST_AUTH",
    "ST_USER",
    "ST_KEY",
    "OS_AUTH_URL",
    "OS_REGION_NAME",
    "OS_USERNAME",
    "OS_USER_ID",
    "OS_PASSWORD",
    "OS_TENANT_ID",
    "OS_TENANT_NAME",
    "OS_USER_DOMAIN_NAME",
    "OS_USER_DOMAIN_ID",
    "OS_PROJECT_NAME",
    "OS_PROJECT_DOMAIN_NAME",
    "OS_PROJECT_DOMAIN_ID",
    "OS_TRUST_ID",
    "OS_APPLICATION_CREDENTIAL_ID",
    "OS_APPLICATION_CREDENTIAL_NAME",
    "OS_APPLICATION_CREDENTIAL_SECRET",
    "OS_STORAGE_URL",
    "OS_AUTH_TOKEN",
    "B2_ACCOUNT_ID",
    "B2_ACCOUNT_KEY",
    "AZURE_ACCOUNT_NAME",
    "AZURE_ACCOUNT_KEY",
    "GOOGLE_PROJECT_ID",
    "GOOGLE_APPLICATION_CREDENTIALS",
];

/// Default size of the cache PVC
pub const DEFAULT_CACHE_CAPACITY: &str = "1Gi";

const CACHE_VOLUME_NAME: &str = "cache";
const CACHE_MOUNT_PATH: &str = "/cache";

/// Name of the cache PVC for a source
pub fn cache_volume_name(source_name: &str) -> String {
    format!("scribe-cache-{}", source_name)
}

/// `restic forget` flags for a retention policy
pub fn forget_options(retain: Option<&ResticRetainPolicy>) -> String {
    let Some(retain) = retain else {
        return "--keep-last 1".to_string();
    };

    let mut options = Vec::new();
    let counts = [
        ("--keep-hourly", retain.hourly),
        ("--keep-daily", retain.daily),
        ("--keep-weekly", retain.weekly),
        ("--keep-monthly", retain.monthly),
        ("--keep-yearly", retain.yearly),
    ];
    for (flag, count) in counts {
        if let Some(count) = count {
            options.push(format!("{} {}", flag, count));
        }
    }
    if let Some(within) = retain.within.as_deref().filter(|w| !w.is_empty()) {
        options.push(format!("--keep-within {}", within));
    }

    if options.is_empty() {
        "--keep-last 1".to_string()
    } else {
        options.join(" ")
    }
}

/// Whether this sync should also prune the repository.
///
/// Due strictly after `pruneIntervalDays` have passed since the last prune,
/// or since the object was created if it has never pruned.
pub fn prune_due(
    interval_days: u32,
    last_pruned: Option<DateTime<Utc>>,
    created: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let Some(since) = last_pruned.or(created) else {
        return false;
    };
    now > since + Duration::hours(i64::from(interval_days) * 24)
}

/// restic mover state for one pass
pub struct ResticMover<'a> {
    pub(crate) spec: &'a ReplicationSourceResticSpec,
}

impl<'a> ResticMover<'a> {
    /// Start a pass for a restic block
    pub fn new(spec: &'a ReplicationSourceResticSpec) -> Self {
        Self { spec }
    }

    pub(crate) async fn run_step(
        &mut self,
        pass: &mut SyncPass<'_>,
        step: MoverStep,
    ) -> Result<bool, Error> {
        match step {
            MoverStep::Validate => self.validate(&pass.name),
            MoverStep::EnsureCache => self.ensure_cache(pass).await,
            MoverStep::EnsureRepository => self.ensure_repository(pass).await,
            other => Err(Error::internal_with_context(
                "restic",
                format!("step {} is not a restic step", other),
            )),
        }
    }

    fn validate(&self, source_name: &str) -> Result<bool, Error> {
        if self.spec.repository.is_empty() {
            return Err(Error::configuration_for_field(
                source_name,
                "spec.restic.repository",
                "Restic repository secret name is required",
            ));
        }
        Ok(true)
    }

    async fn ensure_cache(&self, pass: &SyncPass<'_>) -> Result<bool, Error> {
        let shape = ClaimShape {
            capacity: Some(
                self.spec
                    .cache_capacity
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CACHE_CAPACITY.to_string()),
            ),
            storage_class_name: self.spec.cache_storage_class_name.clone(),
            access_modes: Some(
                self.spec
                    .cache_access_modes
                    .clone()
                    .unwrap_or_else(|| vec!["ReadWriteOnce".to_string()]),
            ),
        };
        let claim = owned_claim(&cache_volume_name(&pass.name), pass.source, &shape, None)?;
        pass.client.apply_pvc(&pass.namespace, &claim).await?;
        Ok(true)
    }

    async fn ensure_repository(&self, pass: &SyncPass<'_>) -> Result<bool, Error> {
        let name = &self.spec.repository;
        let secret = pass
            .client
            .get_secret(&pass.namespace, name)
            .await?
            .ok_or_else(|| {
                Error::missing_reference(&pass.name, "spec.restic.repository", "Secret", name)
            })?;
        validate_secret_keys(&secret, REQUIRED_REPOSITORY_KEYS)
            .map_err(|e| e.with_source_name(&pass.name))?;
        Ok(true)
    }

    fn include_prune(
        &self,
        source_created: Option<DateTime<Utc>>,
        status: &ReplicationSourceStatus,
        now: DateTime<Utc>,
    ) -> bool {
        let last_pruned = status.restic.as_ref().and_then(|r| r.last_pruned);
        prune_due(self.spec.prune_interval_days, last_pruned, source_created, now)
    }

    fn actions(&self, pass: &SyncPass<'_>) -> Vec<String> {
        let created = pass.source.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let mut actions = vec!["backup".to_string()];
        if self.include_prune(created, &pass.status, pass.now) {
            actions.push("prune".to_string());
        } else {
            debug!(source = %pass.name, "skipping prune");
        }
        actions
    }

    pub(crate) fn job_request(
        &self,
        pass: &SyncPass<'_>,
        data_volume: &str,
    ) -> Result<JobRequest, Error> {
        let repository = &self.spec.repository;
        let mut env_vars = vec![
            env("FORGET_OPTIONS", forget_options(self.spec.retain.as_ref())),
            env("DATA_DIR", DATA_MOUNT_PATH),
            env("RESTIC_CACHE_DIR", CACHE_MOUNT_PATH),
        ];
        env_vars.extend(
            REQUIRED_REPOSITORY_KEYS
                .iter()
                .map(|key| env_from_secret(repository, key, false)),
        );
        env_vars.extend(
            OPTIONAL_REPOSITORY_KEYS
                .iter()
                .map(|key| env_from_secret(repository, key, true)),
        );

        let container = Container {
            name: "restic".to_string(),
            image: Some(pass.images.restic.clone()),
            command: Some(vec!["/entry.sh".to_string()]),
            args: Some(self.actions(pass)),
            env: Some(env_vars),
            security_context: Some(root_security_context(&[])),
            volume_mounts: Some(vec![
                mount(DATA_VOLUME_NAME, DATA_MOUNT_PATH),
                mount(CACHE_VOLUME_NAME, CACHE_MOUNT_PATH),
            ]),
            ..Default::default()
        };

        Ok(JobRequest {
            containers: vec![container],
            volumes: vec![
                pvc_volume(DATA_VOLUME_NAME, data_volume),
                pvc_volume(CACHE_VOLUME_NAME, &cache_volume_name(&pass.name)),
            ],
            ..Default::default()
        })
    }

    /// Stamp `lastPruned` when the finished job included a prune.
    ///
    /// Reads the arguments the job ran with, which were fixed when it was
    /// created and may predate prune becoming due.
    pub(crate) fn on_job_succeeded(&self, pass: &mut SyncPass<'_>, template: &PodTemplateSpec) {
        let pruned = template
            .spec
            .iter()
            .flat_map(|pod| &pod.containers)
            .filter(|c| c.name == "restic")
            .flat_map(|c| c.args.iter().flatten())
            .any(|arg| arg == "prune");
        if pruned {
            pass.status
                .restic
                .get_or_insert_with(ReplicationSourceResticStatus::default)
                .last_pruned = Some(pass.now);
            info!(source = %pass.name, "prune completed");
        }
    }
}
