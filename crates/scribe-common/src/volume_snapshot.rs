//! CSI VolumeSnapshot resource types
//!
//! Typed structs for `snapshot.storage.k8s.io/v1` VolumeSnapshot, used by the
//! `Snapshot` copy method. The CRD belongs to the external-snapshotter so it
//! is applied as a `DynamicObject` through `HasApiResource`.

use serde::{Deserialize, Serialize};

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// VolumeSnapshot resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    /// API version
    #[serde(default = "VolumeSnapshot::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "VolumeSnapshot::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Snapshot specification
    pub spec: VolumeSnapshotSpec,
    /// Observed state, populated by the snapshot controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VolumeSnapshotStatus>,
}

impl HasApiResource for VolumeSnapshot {
    const API_VERSION: &'static str = "snapshot.storage.k8s.io/v1";
    const KIND: &'static str = "VolumeSnapshot";
}

impl VolumeSnapshot {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// API group, used as the `dataSource.apiGroup` of restoring PVCs
    pub const API_GROUP: &'static str = "snapshot.storage.k8s.io";

    /// Create a snapshot of a PVC
    pub fn of_pvc(
        metadata: ObjectMeta,
        pvc_name: impl Into<String>,
        snapshot_class: Option<String>,
    ) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec: VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(pvc_name.into()),
                },
                volume_snapshot_class_name: snapshot_class,
            },
            status: None,
        }
    }

    /// True once the snapshot controller reports the snapshot usable
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Size needed to restore this snapshot, once known
    pub fn restore_size(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.restore_size.as_deref())
    }
}

/// VolumeSnapshot spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// What to snapshot
    pub source: VolumeSnapshotSource,
    /// Snapshot class (cluster default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Snapshot source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    /// PVC to snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

/// VolumeSnapshot status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Whether the snapshot can be restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Minimum size of a volume restored from this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
}
