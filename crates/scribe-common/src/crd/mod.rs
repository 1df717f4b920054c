//! Custom Resource Definitions for Scribe
//!
//! This module contains the CRD definitions reconciled by the Scribe
//! controller and the shared condition types they report through.

mod replication_source;
mod types;

pub use replication_source::{
    ReplicationSource, ReplicationSourceExternalSpec, ReplicationSourceRcloneSpec,
    ReplicationSourceResticSpec, ReplicationSourceResticStatus, ReplicationSourceRsyncSpec,
    ReplicationSourceRsyncStatus, ReplicationSourceSpec, ReplicationSourceStatus,
    ReplicationSourceTriggerSpec, ReplicationSourceVolumeOptions, ResticRetainPolicy,
};
pub use types::{
    find_condition, set_condition, Condition, ConditionStatus, CopyMethod, CONDITION_RECONCILED,
    REASON_RECONCILE_COMPLETE, REASON_RECONCILE_ERROR,
};
