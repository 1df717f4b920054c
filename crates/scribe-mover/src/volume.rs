//! The volume a mover job reads from
//!
//! With `copyMethod: None` the job mounts the source PVC directly. `Clone`
//! and `Snapshot` first take a point-in-time copy into a PVC owned by the
//! ReplicationSource, and that copy is released once the sync completes so
//! the next sync starts from a fresh one.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info};

use scribe_common::crd::{CopyMethod, ReplicationSource, ReplicationSourceVolumeOptions};
use scribe_common::kube_utils::{owned_meta, owner_reference, ObjectMeta};
use scribe_common::volume_snapshot::VolumeSnapshot;
use scribe_common::Error;

use crate::client::MoverKubeClient;

/// Name of the point-in-time copy (PVC and VolumeSnapshot)
pub fn copy_volume_name(source_name: &str) -> String {
    format!("scribe-src-{}", source_name)
}

/// Size, class and access modes of a claim Scribe creates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClaimShape {
    /// Requested storage
    pub capacity: Option<String>,
    /// StorageClass, cluster default when unset
    pub storage_class_name: Option<String>,
    /// Access modes
    pub access_modes: Option<Vec<String>>,
}

impl ClaimShape {
    /// Fill unset fields from another claim's spec
    fn or_from(mut self, pvc: &PersistentVolumeClaim) -> Self {
        let spec = pvc.spec.as_ref();
        if self.capacity.is_none() {
            self.capacity = spec
                .and_then(|s| s.resources.as_ref())
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get("storage"))
                .map(|q| q.0.clone());
        }
        if self.storage_class_name.is_none() {
            self.storage_class_name = spec.and_then(|s| s.storage_class_name.clone());
        }
        if self.access_modes.is_none() {
            self.access_modes = spec.and_then(|s| s.access_modes.clone());
        }
        self
    }
}

impl From<&ReplicationSourceVolumeOptions> for ClaimShape {
    fn from(options: &ReplicationSourceVolumeOptions) -> Self {
        Self {
            capacity: options.capacity.clone(),
            storage_class_name: options.storage_class_name.clone(),
            access_modes: options.access_modes.clone(),
        }
    }
}

/// Build a PVC owned by `source`, optionally populated from `data_source`
pub fn owned_claim(
    name: &str,
    source: &ReplicationSource,
    shape: &ClaimShape,
    data_source: Option<TypedLocalObjectReference>,
) -> Result<PersistentVolumeClaim, Error> {
    let resources = shape.capacity.as_ref().map(|capacity| VolumeResourceRequirements {
        requests: Some(BTreeMap::from([(
            "storage".to_string(),
            Quantity(capacity.clone()),
        )])),
        ..Default::default()
    });

    Ok(PersistentVolumeClaim {
        metadata: owned_meta(name, source)?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: shape.access_modes.clone(),
            storage_class_name: shape.storage_class_name.clone(),
            resources,
            data_source,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The "ensure data volume ready" step.
///
/// Returns the PVC name the job should mount, or `None` while a snapshot is
/// not yet ready to restore from.
pub async fn ensure_data_volume(
    client: &dyn MoverKubeClient,
    source: &ReplicationSource,
    options: &ReplicationSourceVolumeOptions,
) -> Result<Option<String>, Error> {
    let namespace = source.namespace().unwrap_or_default();
    let source_pvc_name = &source.spec.source_pvc;
    if source_pvc_name.is_empty() {
        return Err(Error::configuration_for_field(
            source.name_any(),
            "spec.sourcePVC",
            "sourcePVC must be set",
        ));
    }

    let source_pvc = client
        .get_pvc(&namespace, source_pvc_name)
        .await?
        .ok_or_else(|| Error::not_found("PersistentVolumeClaim", source_pvc_name.clone()))?;

    let copy_name = copy_volume_name(&source.name_any());
    let shape = ClaimShape::from(options);

    match options.copy_method {
        CopyMethod::None => Ok(Some(source_pvc_name.clone())),
        CopyMethod::Clone => {
            let pvc = owned_claim(
                &copy_name,
                source,
                &shape.or_from(&source_pvc),
                Some(TypedLocalObjectReference {
                    api_group: None,
                    kind: "PersistentVolumeClaim".to_string(),
                    name: source_pvc_name.clone(),
                }),
            )?;
            client.apply_pvc(&namespace, &pvc).await?;
            debug!(pvc = %copy_name, from = %source_pvc_name, "clone applied");
            Ok(Some(copy_name))
        }
        CopyMethod::Snapshot => {
            let meta = ObjectMeta::new(&copy_name, &namespace).with_owner(owner_reference(source)?);
            let snapshot = VolumeSnapshot::of_pvc(
                meta,
                source_pvc_name.clone(),
                options.volume_snapshot_class_name.clone(),
            );
            let snapshot = client.apply_volume_snapshot(&namespace, &snapshot).await?;
            if !snapshot.is_ready() {
                info!(snapshot = %copy_name, "waiting for snapshot to be ready");
                return Ok(None);
            }

            let mut shape = shape;
            if shape.capacity.is_none() {
                shape.capacity = snapshot.restore_size().map(str::to_string);
            }
            let pvc = owned_claim(
                &copy_name,
                source,
                &shape.or_from(&source_pvc),
                Some(TypedLocalObjectReference {
                    api_group: Some(VolumeSnapshot::API_GROUP.to_string()),
                    kind: "VolumeSnapshot".to_string(),
                    name: copy_name.clone(),
                }),
            )?;
            client.apply_pvc(&namespace, &pvc).await?;
            debug!(pvc = %copy_name, "restore from snapshot applied");
            Ok(Some(copy_name))
        }
    }
}

/// The "release temporary copy" step
pub async fn cleanup_data_volume(
    client: &dyn MoverKubeClient,
    source: &ReplicationSource,
    options: &ReplicationSourceVolumeOptions,
) -> Result<(), Error> {
    let namespace = source.namespace().unwrap_or_default();
    let copy_name = copy_volume_name(&source.name_any());

    match options.copy_method {
        CopyMethod::None => {}
        CopyMethod::Clone => client.delete_pvc(&namespace, &copy_name).await?,
        CopyMethod::Snapshot => {
            client.delete_pvc(&namespace, &copy_name).await?;
            client.delete_volume_snapshot(&namespace, &copy_name).await?;
        }
    }
    Ok(())
}
