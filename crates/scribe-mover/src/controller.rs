//! ReplicationSource controller
//!
//! Selects the mover for the object's method block, runs its step pipeline,
//! and writes the `Reconciled` condition plus everything the pass learned
//! back to the status sub-resource. Objects whose method is handled by
//! another controller are left untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use scribe_common::crd::{set_condition, Condition, ReplicationSource, ReplicationSourceStatus};
use scribe_common::metrics::{MetricsKey, Role, SyncMetrics};
use scribe_common::Error;

use crate::client::{MoverKubeClient, MoverKubeClientImpl};
use crate::config::MoverImages;
use crate::mover::{Method, Mover, MoverRun, SyncPass};

/// Requeue interval for transient failures
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue interval while a referenced object is missing
pub const REFERENCE_REQUEUE: Duration = Duration::from_secs(300);

/// Shared context for the ReplicationSource controller
pub struct MoverContext {
    /// Kubernetes access
    pub kube: Arc<dyn MoverKubeClient>,
    /// Mover images
    pub images: MoverImages,
}

impl MoverContext {
    /// Create a context backed by a real cluster
    pub fn from_client(client: Client, images: MoverImages) -> Self {
        Self {
            kube: Arc::new(MoverKubeClientImpl::new(client)),
            images,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn MoverKubeClient>) -> Self {
        Self {
            kube,
            images: MoverImages::default(),
        }
    }
}

/// Reconcile a ReplicationSource
#[instrument(skip(source, ctx), fields(source = %source.name_any()))]
pub async fn reconcile(
    source: Arc<ReplicationSource>,
    ctx: Arc<MoverContext>,
) -> Result<Action, Error> {
    reconcile_at(&source, &ctx, Utc::now()).await
}

/// [`reconcile`] against an explicit clock
pub async fn reconcile_at(
    source: &ReplicationSource,
    ctx: &MoverContext,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let name = source.name_any();
    let namespace = source.namespace().unwrap_or_default();

    let method = match Method::select(&name, &source.spec) {
        Ok(method) => method,
        Err(e) => {
            let mut status = source.status.clone().unwrap_or_default();
            set_condition(&mut status.conditions, Condition::reconcile_error(e.to_string()));
            if let Err(write_err) = write_status(ctx, source, &status).await {
                warn!(error = %write_err, "failed to record configuration error");
            }
            return Err(e);
        }
    };

    let Some(mover) = Mover::for_method(method) else {
        debug!(?method, "no mover handled by this controller");
        return Ok(Action::await_change());
    };

    let metrics = SyncMetrics::new(MetricsKey {
        name: name.clone(),
        namespace: namespace.clone(),
        role: Role::Source,
        method: mover.method().to_string(),
    });
    let pass = SyncPass::new(ctx.kube.as_ref(), source, &ctx.images, &metrics, now);
    let (mut status, result) = MoverRun { pass, mover }.execute().await;

    let condition = match &result {
        Ok(_) => Condition::reconcile_complete(),
        Err(e) => Condition::reconcile_error(e.to_string()),
    };
    set_condition(&mut status.conditions, condition);

    let written = write_status(ctx, source, &status).await;
    if let Err(e) = &written {
        if result.is_err() {
            warn!(error = %e, "status update failed after pipeline error");
        } else if e.is_conflict() {
            info!("source changed during the pass, status will be rewritten on retry");
        }
    }
    let completed = result?;
    written?;

    let action = requeue_for(status.next_sync_time, now);
    if completed {
        info!(next_sync = ?status.next_sync_time, "sync pass complete");
    }
    Ok(action)
}

async fn write_status(
    ctx: &MoverContext,
    source: &ReplicationSource,
    status: &ReplicationSourceStatus,
) -> Result<(), Error> {
    ctx.kube
        .patch_source_status(
            &source.namespace().unwrap_or_default(),
            &source.name_any(),
            source.resource_version(),
            status,
        )
        .await
}

/// Wake up for the next scheduled sync, or wait for a watch event
pub fn requeue_for(next_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Action {
    match next_sync.and_then(|next| (next - now).to_std().ok()) {
        Some(delay) if !delay.is_zero() => Action::requeue(delay),
        _ => Action::await_change(),
    }
}

/// Error policy for the ReplicationSource controller
///
/// Configuration errors wait for the object to change. A missing Secret
/// never changes the source, so it is checked again after
/// [`REFERENCE_REQUEUE`]. Everything else is retried after [`ERROR_REQUEUE`].
pub fn error_policy(
    source: Arc<ReplicationSource>,
    error: &Error,
    _ctx: Arc<MoverContext>,
) -> Action {
    error!(
        ?error,
        source = %source.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.awaits_reference() {
        Action::requeue(REFERENCE_REQUEUE)
    } else if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockMoverKubeClient;
    use crate::fake::FakeKubeClient;
    use chrono::TimeZone;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use scribe_common::crd::{
        find_condition, ConditionStatus, ReplicationSourceRcloneSpec,
        ReplicationSourceResticSpec, ReplicationSourceRsyncSpec, ReplicationSourceSpec,
        ReplicationSourceTriggerSpec,
        CONDITION_RECONCILED, REASON_RECONCILE_COMPLETE, REASON_RECONCILE_ERROR,
    };
    use std::collections::BTreeMap;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn replication_source(spec: ReplicationSourceSpec) -> ReplicationSource {
        let mut source = ReplicationSource::new("db", spec);
        source.metadata.namespace = Some("apps".to_string());
        source.metadata.uid = Some("uid-1".to_string());
        source.metadata.resource_version = Some("7".to_string());
        source
    }

    fn rclone_spec(schedule: &str) -> ReplicationSourceSpec {
        ReplicationSourceSpec {
            source_pvc: "data".to_string(),
            trigger: Some(ReplicationSourceTriggerSpec {
                schedule: Some(schedule.to_string()),
                manual: None,
            }),
            rclone: Some(ReplicationSourceRcloneSpec {
                rclone_config: Some("rclone-secret".to_string()),
                rclone_config_section: Some("remote".to_string()),
                rclone_dest_path: Some("backups".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn fake_cluster() -> FakeKubeClient {
        FakeKubeClient::default()
            .with_pvc(
                "apps",
                PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some("data".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .with_secret(
                "apps",
                Secret {
                    metadata: ObjectMeta {
                        name: Some("rclone-secret".to_string()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(
                        "rclone.conf".to_string(),
                        ByteString(b"[remote]\ntype = s3\n".to_vec()),
                    )])),
                    ..Default::default()
                },
            )
    }

    fn job_args(job: &Job) -> Vec<String> {
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        pod.containers[0].args.clone().unwrap_or_default()
    }

    fn parallelism(job: &Job) -> Option<i32> {
        job.spec.as_ref().unwrap().parallelism
    }

    fn reconciled(status: &ReplicationSourceStatus) -> &Condition {
        find_condition(&status.conditions, CONDITION_RECONCILED).unwrap()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Story: two method blocks are rejected before any child is touched
    #[tokio::test]
    async fn story_multiple_methods_rejected() {
        let source = Arc::new(replication_source(ReplicationSourceSpec {
            source_pvc: "data".to_string(),
            rsync: Some(ReplicationSourceRsyncSpec::default()),
            rclone: Some(ReplicationSourceRcloneSpec::default()),
            ..Default::default()
        }));

        let mut kube = MockMoverKubeClient::new();
        kube.expect_apply_job().never();
        kube.expect_get_pvc().never();
        kube.expect_patch_source_status()
            .withf(|ns, name, rv, status| {
                let cond = find_condition(&status.conditions, CONDITION_RECONCILED).unwrap();
                ns == "apps"
                    && name == "db"
                    && rv.as_deref() == Some("7")
                    && cond.status == ConditionStatus::False
                    && cond.reason == REASON_RECONCILE_ERROR
                    && cond.message == "only a single replication method can be provided"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let ctx = Arc::new(MoverContext::for_testing(Arc::new(kube)));

        let err = reconcile(source.clone(), ctx.clone()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(error_policy(source, &err, ctx), Action::await_change());
    }

    #[tokio::test]
    async fn test_external_method_is_ignored() {
        let source = Arc::new(replication_source(ReplicationSourceSpec {
            external: Some(Default::default()),
            ..Default::default()
        }));
        let mut kube = MockMoverKubeClient::new();
        kube.expect_patch_source_status().never();
        let ctx = Arc::new(MoverContext::for_testing(Arc::new(kube)));

        assert_eq!(reconcile(source, ctx).await.unwrap(), Action::await_change());
    }

    #[tokio::test]
    async fn test_unconfigured_source_is_ignored() {
        let source = Arc::new(replication_source(ReplicationSourceSpec::default()));
        let mut kube = MockMoverKubeClient::new();
        kube.expect_patch_source_status().never();
        let ctx = Arc::new(MoverContext::for_testing(Arc::new(kube)));

        assert_eq!(reconcile(source, ctx).await.unwrap(), Action::await_change());
    }

    // =========================================================================
    // Full sync lifecycle
    // =========================================================================

    /// Story: a scheduled rclone source runs its first sync to completion
    /// across passes, then sleeps until the next boundary
    #[tokio::test]
    async fn story_rclone_sync_lifecycle() {
        let fake = Arc::new(fake_cluster());
        let ctx = MoverContext::for_testing(fake.clone());
        let mut source = replication_source(rclone_spec("0 * * * *"));

        // Pass 1: never synced, so due now. The job starts and the pass suspends.
        let action = reconcile_at(&source, &ctx, at(10, 5)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(fake.has_job("apps", "scribe-rclone-src-db"));
        let status = fake.last_status().unwrap();
        assert_eq!(status.next_sync_time, Some(at(10, 5)));
        assert_eq!(reconciled(&status).reason, REASON_RECONCILE_COMPLETE);
        assert!(status.last_sync_time.is_none());
        {
            let state = fake.state.lock().unwrap();
            let sa = state
                .service_accounts
                .get(&("apps".to_string(), "scribe-src-db".to_string()));
            assert!(sa.is_some());
        }

        // Pass 2: the job finished; the sync is recorded and the job removed
        fake.finish_job("apps", "scribe-rclone-src-db", at(10, 5));
        source.status = Some(status);
        let action = reconcile_at(&source, &ctx, at(10, 7)).await.unwrap();
        let status = fake.last_status().unwrap();
        assert_eq!(status.last_sync_time, Some(at(10, 7)));
        assert_eq!(status.last_sync_duration.as_deref(), Some("2m0s"));
        assert_eq!(status.next_sync_time, Some(at(11, 0)));
        assert!(!fake.has_job("apps", "scribe-rclone-src-db"));
        assert_eq!(action, Action::requeue(Duration::from_secs(53 * 60)));

        // Pass 3: before the boundary nothing runs
        source.status = Some(status);
        let action = reconcile_at(&source, &ctx, at(10, 30)).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30 * 60)));
        assert!(!fake.has_job("apps", "scribe-rclone-src-db"));
    }

    /// Story: pausing a source keeps its Job with no pods, and resuming
    /// scales the same Job back up instead of replacing it
    #[tokio::test]
    async fn story_pause_and_resume_keep_the_job() {
        let fake = Arc::new(fake_cluster());
        let ctx = MoverContext::for_testing(fake.clone());
        let mut source = replication_source(rclone_spec("0 * * * *"));
        source.spec.paused = true;

        reconcile_at(&source, &ctx, at(10, 5)).await.unwrap();
        let job = fake.job("apps", "scribe-rclone-src-db").unwrap();
        assert_eq!(parallelism(&job), Some(0));

        source.status = fake.last_status();
        source.spec.paused = false;
        reconcile_at(&source, &ctx, at(10, 6)).await.unwrap();
        let job = fake.job("apps", "scribe-rclone-src-db").unwrap();
        assert_eq!(parallelism(&job), Some(1));
        assert!(fake.state.lock().unwrap().deleted_jobs.is_empty());
        assert_eq!(
            reconciled(&fake.last_status().unwrap()).status,
            ConditionStatus::True
        );
    }

    /// Story: prune falls due while a backup-only restic job is running. The
    /// job finishes with the arguments it started with and no prune is recorded.
    #[tokio::test]
    async fn story_prune_due_mid_run_leaves_running_job_alone() {
        let created = at(0, 0);
        let fake = Arc::new(fake_cluster().with_secret(
            "apps",
            Secret {
                metadata: ObjectMeta {
                    name: Some("restic-config".to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([
                    ("RESTIC_REPOSITORY".to_string(), ByteString(b"s3:bucket".to_vec())),
                    ("RESTIC_PASSWORD".to_string(), ByteString(b"hunter2".to_vec())),
                ])),
                ..Default::default()
            },
        ));
        let ctx = MoverContext::for_testing(fake.clone());
        let mut source = replication_source(ReplicationSourceSpec {
            source_pvc: "data".to_string(),
            trigger: Some(ReplicationSourceTriggerSpec {
                schedule: Some("0 * * * *".to_string()),
                manual: None,
            }),
            restic: Some(ReplicationSourceResticSpec {
                repository: "restic-config".to_string(),
                prune_interval_days: 1,
                ..Default::default()
            }),
            ..Default::default()
        });
        source.metadata.creation_timestamp = Some(Time(created));

        // 23h after creation: prune is not due yet
        reconcile_at(&source, &ctx, created + chrono::Duration::hours(23))
            .await
            .unwrap();
        let job = fake.job("apps", "scribe-restic-src-db").unwrap();
        assert_eq!(job_args(&job), vec!["backup"]);

        // 25h: prune is due, but the running job is neither changed nor deleted
        source.status = fake.last_status();
        reconcile_at(&source, &ctx, created + chrono::Duration::hours(25))
            .await
            .unwrap();
        let job = fake.job("apps", "scribe-restic-src-db").unwrap();
        assert_eq!(job_args(&job), vec!["backup"]);
        assert!(fake.state.lock().unwrap().deleted_jobs.is_empty());
        let status = fake.last_status().unwrap();
        assert_eq!(reconciled(&status).status, ConditionStatus::True);

        // The job completes; the sync is recorded without a prune
        fake.finish_job(
            "apps",
            "scribe-restic-src-db",
            created + chrono::Duration::hours(23),
        );
        source.status = Some(status);
        reconcile_at(&source, &ctx, created + chrono::Duration::hours(26))
            .await
            .unwrap();
        let status = fake.last_status().unwrap();
        assert_eq!(status.last_sync_time, Some(created + chrono::Duration::hours(26)));
        assert!(status.restic.and_then(|r| r.last_pruned).is_none());
    }

    /// Story: an apply the API server rejects marks the condition False
    /// and leaves the existing Job in place
    #[tokio::test]
    async fn story_rejected_job_apply_reports_error() {
        let source = replication_source(rclone_spec("0 * * * *"));
        let mut client = MockMoverKubeClient::new();
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let secrets = fake_cluster().state.into_inner().unwrap().secrets;
        client.expect_get_pvc().returning(move |_, _| Ok(Some(pvc.clone())));
        client.expect_get_secret()
            .returning(move |ns, name| Ok(secrets.get(&(ns.to_string(), name.to_string())).cloned()));
        client.expect_apply_service_account().returning(|_, _| Ok(()));
        client.expect_get_job().returning(|_, _| Ok(None));
        client.expect_apply_job().returning(|_, _| {
            Err(Error::from(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "spec.template.spec.containers[0].image: Required value".to_string(),
                reason: "Invalid".to_string(),
                code: 422,
            })))
        });
        client.expect_delete_job().never();
        client.expect_patch_source_status()
            .withf(|_, _, _, status| {
                let cond = find_condition(&status.conditions, CONDITION_RECONCILED).unwrap();
                cond.status == ConditionStatus::False && cond.message.contains("Required value")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let source = Arc::new(source);
        let ctx = Arc::new(MoverContext::for_testing(Arc::new(client)));

        let err = reconcile(source.clone(), ctx.clone()).await.unwrap_err();
        assert_eq!(error_policy(source, &err, ctx), Action::await_change());
    }

    /// Story: a job that exhausted its retries is replaced, not reported as an error
    #[tokio::test]
    async fn story_failed_job_is_replaced() {
        let fake = Arc::new(fake_cluster());
        let ctx = MoverContext::for_testing(fake.clone());
        let source = replication_source(rclone_spec("0 * * * *"));

        reconcile_at(&source, &ctx, at(10, 5)).await.unwrap();
        fake.fail_job("apps", "scribe-rclone-src-db", 2);
        reconcile_at(&source, &ctx, at(10, 6)).await.unwrap();

        let state = fake.state.lock().unwrap();
        assert_eq!(state.deleted_jobs, vec!["scribe-rclone-src-db".to_string()]);
        let status = state.statuses.last().unwrap();
        assert_eq!(reconciled(status).status, ConditionStatus::True);
    }

    /// Story: a missing config secret marks the condition False and is checked
    /// again on the slow requeue, then syncs once the secret appears
    #[tokio::test]
    async fn story_missing_config_secret_reports_error() {
        let fake = Arc::new(FakeKubeClient::default().with_pvc(
            "apps",
            PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        ));
        let ctx = MoverContext::for_testing(fake.clone());
        let source = replication_source(rclone_spec("0 * * * *"));

        let err = reconcile_at(&source, &ctx, at(10, 5)).await.unwrap_err();
        assert!(!err.is_retryable());
        let status = fake.last_status().unwrap();
        let cond = reconciled(&status);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message, err.to_string());
        assert!(!fake.has_job("apps", "scribe-rclone-src-db"));

        let ctx = Arc::new(ctx);
        assert_eq!(
            error_policy(Arc::new(source.clone()), &err, ctx.clone()),
            Action::requeue(REFERENCE_REQUEUE)
        );

        // The secret is created out of band; the requeued pass starts the sync
        let secrets = fake_cluster().state.into_inner().unwrap().secrets;
        fake.state.lock().unwrap().secrets.extend(secrets);
        reconcile_at(&source, &ctx, at(10, 10)).await.unwrap();
        assert!(fake.has_job("apps", "scribe-rclone-src-db"));
        assert_eq!(
            reconciled(&fake.last_status().unwrap()).status,
            ConditionStatus::True
        );
    }

    // =========================================================================
    // Status write and requeue
    // =========================================================================

    /// Story: the pipeline error is returned even when the status write also fails
    #[tokio::test]
    async fn story_pipeline_error_wins_over_status_error() {
        let source = replication_source(rclone_spec("0 * * * *"));
        let mut kube = MockMoverKubeClient::new();
        kube.expect_get_pvc().returning(|_, _| Ok(None));
        kube.expect_patch_source_status()
            .returning(|_, _, _, _| Err(Error::internal("conflict")));
        let ctx = MoverContext::for_testing(Arc::new(kube));

        let err = reconcile_at(&source, &ctx, at(10, 5)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_status_error_surfaces_after_clean_pass() {
        let mut source = replication_source(rclone_spec("0 * * * *"));
        source.status = Some(ReplicationSourceStatus {
            last_sync_time: Some(at(10, 1)),
            ..Default::default()
        });

        let mut kube = MockMoverKubeClient::new();
        kube.expect_patch_source_status()
            .returning(|_, _, _, _| Err(Error::internal("conflict")));
        let ctx = MoverContext::for_testing(Arc::new(kube));

        // Not due yet, so only the status write touches the cluster
        assert!(reconcile_at(&source, &ctx, at(10, 30)).await.is_err());
    }

    #[test]
    fn test_requeue_for_next_sync() {
        assert_eq!(
            requeue_for(Some(at(11, 0)), at(10, 59)),
            Action::requeue(Duration::from_secs(60))
        );
        assert_eq!(requeue_for(Some(at(10, 0)), at(10, 0)), Action::await_change());
        assert_eq!(requeue_for(Some(at(9, 0)), at(10, 0)), Action::await_change());
        assert_eq!(requeue_for(None, at(10, 0)), Action::await_change());
    }

    #[test]
    fn test_error_policy_retries_transient_errors() {
        let source = Arc::new(replication_source(ReplicationSourceSpec::default()));
        let ctx = Arc::new(MoverContext::for_testing(Arc::new(MockMoverKubeClient::new())));
        let transient = Error::not_found("PersistentVolumeClaim", "data");
        assert_eq!(
            error_policy(source.clone(), &transient, ctx.clone()),
            Action::requeue(ERROR_REQUEUE)
        );
        let permanent = Error::configuration_for("db", "bad schedule");
        assert_eq!(
            error_policy(source.clone(), &permanent, ctx.clone()),
            Action::await_change()
        );
        let missing = Error::missing_reference("db", "spec.rclone.rcloneConfig", "Secret", "rc");
        assert_eq!(
            error_policy(source, &missing, ctx),
            Action::requeue(REFERENCE_REQUEUE)
        );
    }
}
