//! ReplicationSource CRD types
//!
//! A `ReplicationSource` names a PVC, a trigger (cron schedule or manual
//! token), and exactly one replication method block. The controller owns the
//! status sub-resource and rewrites it after every reconcile pass.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, CopyMethod};

// =============================================================================
// Trigger
// =============================================================================

/// Controls when a sync runs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceTriggerSpec {
    /// Cron-style schedule (5 fields, or a descriptor such as `@hourly`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Opaque token; changing it requests exactly one sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<String>,
}

// =============================================================================
// Method blocks
// =============================================================================

/// Options controlling the point-in-time copy taken before each sync
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceVolumeOptions {
    /// How the source volume is copied before syncing
    #[serde(default)]
    pub copy_method: CopyMethod,

    /// Size of the copy PVC (defaults to the source's size)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,

    /// StorageClass of the copy PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Access modes of the copy PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,

    /// VolumeSnapshotClass used when `copyMethod: Snapshot`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// rsync over ssh
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceRsyncSpec {
    /// Point-in-time copy options
    #[serde(flatten)]
    pub volume: ReplicationSourceVolumeOptions,

    /// Secret holding `source`, `source.pub`, `destination.pub`. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<String>,

    /// Service type used when this side listens for the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Remote address to connect to. When set no Service is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// ssh port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Remote path to write into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Remote ssh user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
}

/// rclone to an object store
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceRcloneSpec {
    /// Point-in-time copy options
    #[serde(flatten)]
    pub volume: ReplicationSourceVolumeOptions,

    /// Secret containing `rclone.conf`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rclone_config: Option<String>,

    /// Section of `rclone.conf` to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rclone_config_section: Option<String>,

    /// Destination path within the remote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rclone_dest_path: Option<String>,
}

/// Retention policy applied by `restic forget`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResticRetainPolicy {
    /// Hourly snapshots to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly: Option<i32>,
    /// Daily snapshots to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<i32>,
    /// Weekly snapshots to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<i32>,
    /// Monthly snapshots to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly: Option<i32>,
    /// Yearly snapshots to keep
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yearly: Option<i32>,
    /// Keep everything newer than this duration (restic syntax, e.g. `3d`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
}

/// restic backup into a repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceResticSpec {
    /// Point-in-time copy options
    #[serde(flatten)]
    pub volume: ReplicationSourceVolumeOptions,

    /// Secret holding the repository location and credentials
    #[serde(default)]
    pub repository: String,

    /// Days between prune passes
    #[serde(default = "default_prune_interval_days")]
    pub prune_interval_days: u32,

    /// Retention policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain: Option<ResticRetainPolicy>,

    /// Size of the restic cache PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_capacity: Option<String>,

    /// StorageClass of the restic cache PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_storage_class_name: Option<String>,

    /// Access modes of the restic cache PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_access_modes: Option<Vec<String>>,
}

fn default_prune_interval_days() -> u32 {
    7
}

/// Replication handled by a controller other than this one
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceExternalSpec {
    /// Name of the external provider
    pub provider: String,
    /// Provider-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

// =============================================================================
// CRD
// =============================================================================

/// Desired replication of one PVC
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "scribe.backube",
    version = "v1alpha1",
    kind = "ReplicationSource",
    plural = "replicationsources",
    namespaced,
    status = "ReplicationSourceStatus",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.sourcePVC"}"#,
    printcolumn = r#"{"name":"Last sync","type":"string","format":"date-time","jsonPath":".status.lastSyncTime"}"#,
    printcolumn = r#"{"name":"Duration","type":"string","jsonPath":".status.lastSyncDuration"}"#,
    printcolumn = r#"{"name":"Next sync","type":"string","format":"date-time","jsonPath":".status.nextSyncTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceSpec {
    /// Name of the PVC to replicate
    #[serde(rename = "sourcePVC", default)]
    pub source_pvc: String,

    /// When to replicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<ReplicationSourceTriggerSpec>,

    /// Stop running mover pods without deleting the job
    #[serde(default)]
    pub paused: bool,

    /// rsync method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync: Option<ReplicationSourceRsyncSpec>,

    /// rclone method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rclone: Option<ReplicationSourceRcloneSpec>,

    /// restic method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restic: Option<ReplicationSourceResticSpec>,

    /// Externally handled method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ReplicationSourceExternalSpec>,
}

impl ReplicationSourceSpec {
    /// Names of every populated method block, in declaration order
    pub fn configured_methods(&self) -> Vec<&'static str> {
        let mut methods = Vec::new();
        if self.rsync.is_some() {
            methods.push("rsync");
        }
        if self.rclone.is_some() {
            methods.push("rclone");
        }
        if self.restic.is_some() {
            methods.push("restic");
        }
        if self.external.is_some() {
            methods.push("external");
        }
        methods
    }

    /// The manual trigger token, if one is set and non-empty
    pub fn manual_token(&self) -> Option<&str> {
        self.trigger
            .as_ref()
            .and_then(|t| t.manual.as_deref())
            .filter(|m| !m.is_empty())
    }

    /// The cron schedule in effect. A manual token disables the schedule.
    pub fn effective_schedule(&self) -> Option<&str> {
        if self.manual_token().is_some() {
            return None;
        }
        self.trigger
            .as_ref()
            .and_then(|t| t.schedule.as_deref())
            .filter(|s| !s.is_empty())
    }
}

// =============================================================================
// Status
// =============================================================================

/// rsync-specific status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceRsyncStatus {
    /// Address the peer should connect to
    #[serde(default)]
    pub address: Option<String>,
    /// Secret the peer should use for its keys
    #[serde(default)]
    pub ssh_keys: Option<String>,
}

/// restic-specific status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceResticStatus {
    /// Completion time of the last job that ran a prune
    #[serde(default)]
    pub last_pruned: Option<DateTime<Utc>>,
}

/// Observed state of a ReplicationSource.
///
/// `None` fields serialize as `null` so a merge patch clears them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceStatus {
    /// Latest observations of the object's state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Completion time of the most recent sync
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,

    /// Time the next sync is due. Null when there is no schedule.
    #[serde(default)]
    pub next_sync_time: Option<DateTime<Utc>>,

    /// Manual trigger token satisfied by the most recent sync
    #[serde(default)]
    pub last_manual_sync: Option<String>,

    /// Duration of the most recent sync (e.g. `1m30s`)
    #[serde(default)]
    pub last_sync_duration: Option<String>,

    /// rsync-specific status
    #[serde(default)]
    pub rsync: Option<ReplicationSourceRsyncStatus>,

    /// restic-specific status
    #[serde(default)]
    pub restic: Option<ReplicationSourceResticStatus>,
}
