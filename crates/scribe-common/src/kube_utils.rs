//! Shared Kubernetes utilities using kube-rs
//!
//! Metadata builders that stamp owner references and management labels on
//! every child resource, the `HasApiResource` trait for CRDs Scribe consumes
//! but does not define, and secret key validation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta as K8sObjectMeta, OwnerReference};
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};

use crate::crd::ReplicationSource;
use crate::Error;

// =============================================================================
// ObjectMeta - metadata for typed resources applied as DynamicObjects
// =============================================================================

/// Kubernetes metadata for resources serialized by hand (external CRDs).
///
/// Carries the owner references so cascade deletion works for snapshots the
/// same way it does for core resources.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Owner references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Create new metadata with the standard Scribe management label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_SCRIBE.to_string(),
        );
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            owner_references: Vec::new(),
        }
    }

    /// Set the controlling owner
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references = vec![owner];
        self
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implemented by external CRD types (e.g. `VolumeSnapshot`) that are not
/// generated by `kube::CustomResource` and are applied as `DynamicObject`s.
pub trait HasApiResource {
    /// Full API version (e.g., "snapshot.storage.k8s.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "VolumeSnapshot")
    const KIND: &'static str;

    /// Build the `ApiResource` for this type
    fn api_resource() -> ApiResource {
        let (group, version) = parse_api_version(Self::API_VERSION);
        ApiResource {
            group,
            version,
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            plural: pluralize_kind(Self::KIND),
        }
    }
}

/// Split an apiVersion into (group, version). Core resources have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural of a kind, following Kubernetes' simple pluralization
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// Ownership
// =============================================================================

/// Build the controller owner reference pointing at a ReplicationSource.
///
/// Fails when the object has not been persisted yet (no uid).
pub fn owner_reference(source: &ReplicationSource) -> Result<OwnerReference, Error> {
    source.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!("ReplicationSource {} has no uid", source.name_any()),
        )
    })
}

/// Metadata for a core resource owned by a ReplicationSource
pub fn owned_meta(
    name: impl Into<String>,
    source: &ReplicationSource,
) -> Result<K8sObjectMeta, Error> {
    Ok(K8sObjectMeta {
        name: Some(name.into()),
        namespace: source.namespace(),
        labels: Some(BTreeMap::from([(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_SCRIBE.to_string(),
        )])),
        owner_references: Some(vec![owner_reference(source)?]),
        ..Default::default()
    })
}

// =============================================================================
// Secrets
// =============================================================================

/// Check that a secret carries every required key.
///
/// Both `data` and `stringData` count, since a freshly created secret may
/// only have been written with string data. Callers attach the owning
/// ReplicationSource with [`Error::with_source_name`].
pub fn validate_secret_keys(secret: &Secret, required: &[&str]) -> Result<(), Error> {
    let name = secret.name_any();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|key| {
            let in_data = secret.data.as_ref().is_some_and(|d| d.contains_key(*key));
            let in_string_data = secret
                .string_data
                .as_ref()
                .is_some_and(|d| d.contains_key(*key));
            !in_data && !in_string_data
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "secret {} is missing required field(s): {}",
            name,
            missing.join(", ")
        )))
    }
}

// =============================================================================
// Formatting
// =============================================================================

/// Render a duration the way Kubernetes prints `metav1.Duration` (e.g. `1h2m3.5s`)
pub fn format_duration(duration: chrono::Duration) -> String {
    let total_ms = duration.num_milliseconds().max(0);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let millis = total_ms % 60_000;

    let seconds = if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        let s = format!("{}.{:03}", millis / 1000, millis % 1000);
        format!("{}s", s.trim_end_matches('0'))
    };

    match (hours, minutes) {
        (0, 0) => seconds,
        (0, m) => format!("{}m{}", m, seconds),
        (h, m) => format!("{}h{}m{}", h, m, seconds),
    }
}
