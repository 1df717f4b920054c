//! Common types for Scribe: CRDs, errors, metrics, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;
pub mod volume_snapshot;

pub use error::Error;

/// Field manager used for every server-side apply issued by the controller
pub const FIELD_MANAGER: &str = "scribe-controller";

/// Label key identifying the managing component
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for resources managed by Scribe
pub const LABEL_MANAGED_BY_SCRIBE: &str = "scribe";

/// Label key for the part-of relationship on mover pods
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Label key naming the owning component of a mover pod
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Label key naming the instance a mover pod belongs to
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
