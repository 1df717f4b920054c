//! rclone to an object store
//!
//! Pushes the data volume to `rcloneDestPath` on the remote described by one
//! section of an `rclone.conf` held in a secret.

use k8s_openapi::api::core::v1::Container;
use tracing::debug;

use scribe_common::crd::ReplicationSourceRcloneSpec;
use scribe_common::kube_utils::validate_secret_keys;
use scribe_common::Error;

use super::{require_field, MoverStep, SyncPass};
use crate::job::{
    env, mount, pvc_volume, root_security_context, secret_volume, JobRequest, DATA_MOUNT_PATH,
    DATA_VOLUME_NAME,
};

/// rclone step table
pub const STEPS: &[MoverStep] = &[
    MoverStep::AwaitNextSync,
    MoverStep::Validate,
    MoverStep::EnsureDataVolume,
    MoverStep::EnsureServiceAccount,
    MoverStep::EnsureConfig,
    MoverStep::EnsureJob,
    MoverStep::CleanupJob,
    MoverStep::CleanupVolume,
];

/// Key of the config file inside the secret
pub const CONFIG_KEY: &str = "rclone.conf";

const CONFIG_VOLUME_NAME: &str = "rclone-secret";
const CONFIG_MOUNT_PATH: &str = "/rclone-config";

/// Fields resolved by validation
#[derive(Clone, Debug, PartialEq, Eq)]
struct RcloneTarget {
    config_secret: String,
    config_section: String,
    dest_path: String,
}

/// rclone mover state for one pass
pub struct RcloneMover<'a> {
    pub(crate) spec: &'a ReplicationSourceRcloneSpec,
    target: Option<RcloneTarget>,
}

impl<'a> RcloneMover<'a> {
    /// Start a pass for an rclone block
    pub fn new(spec: &'a ReplicationSourceRcloneSpec) -> Self {
        Self { spec, target: None }
    }

    pub(crate) async fn run_step(
        &mut self,
        pass: &mut SyncPass<'_>,
        step: MoverStep,
    ) -> Result<bool, Error> {
        match step {
            MoverStep::Validate => self.validate(&pass.name),
            MoverStep::EnsureConfig => self.ensure_config(pass).await,
            other => Err(Error::internal_with_context(
                "rclone",
                format!("step {} is not an rclone step", other),
            )),
        }
    }

    fn validate(&mut self, source_name: &str) -> Result<bool, Error> {
        let config_secret = require_field(
            source_name,
            "spec.rclone.rcloneConfig",
            self.spec.rclone_config.as_deref(),
            "Rclone config secret name is required",
        )?;
        let config_section = require_field(
            source_name,
            "spec.rclone.rcloneConfigSection",
            self.spec.rclone_config_section.as_deref(),
            "Rclone config section is required",
        )?;
        let dest_path = require_field(
            source_name,
            "spec.rclone.rcloneDestPath",
            self.spec.rclone_dest_path.as_deref(),
            "Rclone destination path is required",
        )?;
        self.target = Some(RcloneTarget {
            config_secret: config_secret.to_string(),
            config_section: config_section.to_string(),
            dest_path: dest_path.to_string(),
        });
        Ok(true)
    }

    fn target(&self) -> Result<&RcloneTarget, Error> {
        self.target
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("rclone", "spec not validated"))
    }

    async fn ensure_config(&self, pass: &SyncPass<'_>) -> Result<bool, Error> {
        let name = &self.target()?.config_secret;
        let secret = pass
            .client
            .get_secret(&pass.namespace, name)
            .await?
            .ok_or_else(|| {
                Error::missing_reference(&pass.name, "spec.rclone.rcloneConfig", "Secret", name)
            })?;
        validate_secret_keys(&secret, &[CONFIG_KEY])
            .map_err(|e| e.with_source_name(&pass.name))?;
        debug!(source = %pass.name, secret = %name, "rclone config validated");
        Ok(true)
    }

    pub(crate) fn job_request(
        &self,
        pass: &SyncPass<'_>,
        data_volume: &str,
    ) -> Result<JobRequest, Error> {
        let target = self.target()?;
        let container = Container {
            name: "rclone".to_string(),
            image: Some(pass.images.rclone.clone()),
            command: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                "./active.sh".to_string(),
            ]),
            env: Some(vec![
                env("RCLONE_CONFIG", format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY)),
                env("RCLONE_DEST_PATH", target.dest_path.clone()),
                env("DIRECTION", "source"),
                env("MOUNT_PATH", DATA_MOUNT_PATH),
                env("RCLONE_CONFIG_SECTION", target.config_section.clone()),
            ]),
            security_context: Some(root_security_context(&[])),
            volume_mounts: Some(vec![
                mount(DATA_VOLUME_NAME, DATA_MOUNT_PATH),
                mount(CONFIG_VOLUME_NAME, CONFIG_MOUNT_PATH),
            ]),
            ..Default::default()
        };

        Ok(JobRequest {
            containers: vec![container],
            volumes: vec![
                pvc_volume(DATA_VOLUME_NAME, data_volume),
                secret_volume(CONFIG_VOLUME_NAME, &target.config_secret),
            ],
            ..Default::default()
        })
    }
}
