//! rsync over ssh
//!
//! The source side either dials a configured `address`, or listens behind a
//! Service whose address is published to `status.rsync.address` for the
//! destination to use. Keys come from a user-supplied secret or are generated
//! once and split into a source-side and a destination-side secret.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use kube::ResourceExt;
use tracing::{debug, info};

use scribe_common::crd::{ReplicationSourceRsyncSpec, ReplicationSourceRsyncStatus};
use scribe_common::kube_utils::{owned_meta, validate_secret_keys};
use scribe_common::{Error, LABEL_COMPONENT, LABEL_NAME, LABEL_PART_OF};

use super::{MoverStep, SyncPass};
use crate::job::{
    env, mount, pvc_volume, root_security_context, secret_volume, JobRequest,
    DATA_MOUNT_PATH, DATA_VOLUME_NAME,
};

/// rsync step table
pub const STEPS: &[MoverStep] = &[
    MoverStep::AwaitNextSync,
    MoverStep::EnsureDataVolume,
    MoverStep::EnsureService,
    MoverStep::PublishAddress,
    MoverStep::EnsureKeys,
    MoverStep::EnsureServiceAccount,
    MoverStep::EnsureJob,
    MoverStep::CleanupJob,
    MoverStep::CleanupVolume,
];

/// Port sshd listens on inside the mover pod
pub const SSH_PORT: i32 = 22;

const KEYS_VOLUME_NAME: &str = "keys";
const KEYS_MOUNT_PATH: &str = "/keys";
const SOURCE_KEY_FIELDS: &[&str] = &["source", "source.pub", "destination.pub"];

/// Name of the Service (and Job) for a source
pub fn resource_name(source_name: &str) -> String {
    format!("scribe-rsync-src-{}", source_name)
}

/// Labels selecting the mover pod
pub fn selector_labels(source_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), format!("src-{}", source_name)),
        (LABEL_COMPONENT.to_string(), "rsync-mover".to_string()),
        (LABEL_PART_OF.to_string(), "scribe".to_string()),
    ])
}

/// Address a peer should use to reach a Service, once one is assigned
pub fn service_address(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() == Some("LoadBalancer") {
        let ingress = service
            .status
            .as_ref()?
            .load_balancer
            .as_ref()?
            .ingress
            .as_ref()?
            .first()?;
        ingress
            .hostname
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| ingress.ip.clone().filter(|ip| !ip.is_empty()))
    } else {
        spec.cluster_ip
            .clone()
            .filter(|ip| !ip.is_empty() && ip != "None")
    }
}

/// A fresh Ed25519 keypair as (OpenSSH private key, public key line)
pub fn generate_keypair() -> Result<(String, String), Error> {
    let keygen_error = |e: ssh_key::Error| {
        Error::internal_with_context("keygen", format!("failed to generate ssh key: {}", e))
    };
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(keygen_error)?;
    let private = key.to_openssh(LineEnding::LF).map_err(keygen_error)?;
    let public = key.public_key().to_openssh().map_err(keygen_error)?;
    Ok((private.to_string(), public))
}

fn secret_value(secret: &Secret, key: &str) -> Option<ByteString> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key).cloned())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|v| ByteString(v.clone().into_bytes()))
        })
}

/// Copy a subset of keys from the main secret into a derived one
fn derived_secret(
    pass: &SyncPass<'_>,
    name: String,
    main: &Secret,
    keys: &[&str],
) -> Result<Secret, Error> {
    let mut data = BTreeMap::new();
    for key in keys {
        let value = secret_value(main, key).ok_or_else(|| {
            Error::internal_with_context(
                "keygen",
                format!("secret {} is missing {}", main.name_any(), key),
            )
        })?;
        data.insert(key.to_string(), value);
    }
    Ok(Secret {
        metadata: owned_meta(name, pass.source)?,
        data: Some(data),
        ..Default::default()
    })
}

/// rsync mover state for one pass
pub struct RsyncMover<'a> {
    pub(crate) spec: &'a ReplicationSourceRsyncSpec,
    service: Option<Service>,
    keys_secret: Option<String>,
}

impl<'a> RsyncMover<'a> {
    /// Start a pass for an rsync block
    pub fn new(spec: &'a ReplicationSourceRsyncSpec) -> Self {
        Self {
            spec,
            service: None,
            keys_secret: None,
        }
    }

    pub(crate) async fn run_step(
        &mut self,
        pass: &mut SyncPass<'_>,
        step: MoverStep,
    ) -> Result<bool, Error> {
        match step {
            MoverStep::EnsureService => self.ensure_service(pass).await,
            MoverStep::PublishAddress => Ok(self.publish_address(pass)),
            MoverStep::EnsureKeys => self.ensure_keys(pass).await,
            other => Err(Error::internal_with_context(
                "rsync",
                format!("step {} is not an rsync step", other),
            )),
        }
    }

    async fn ensure_service(&mut self, pass: &SyncPass<'_>) -> Result<bool, Error> {
        if self.spec.address.is_some() {
            debug!(source = %pass.name, "outbound connection, no service needed");
            return Ok(true);
        }

        let service = Service {
            metadata: owned_meta(resource_name(&pass.name), pass.source)?,
            spec: Some(ServiceSpec {
                type_: Some(
                    self.spec
                        .service_type
                        .clone()
                        .unwrap_or_else(|| "ClusterIP".to_string()),
                ),
                selector: Some(selector_labels(&pass.name)),
                ports: Some(vec![ServicePort {
                    name: Some("ssh".to_string()),
                    port: self.spec.port.unwrap_or(SSH_PORT),
                    protocol: Some("TCP".to_string()),
                    target_port: Some(IntOrString::Int(SSH_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.service = Some(pass.client.apply_service(&pass.namespace, &service).await?);
        Ok(true)
    }

    fn publish_address(&self, pass: &mut SyncPass<'_>) -> bool {
        let status = pass
            .status
            .rsync
            .get_or_insert_with(ReplicationSourceRsyncStatus::default);

        let Some(service) = &self.service else {
            status.address = None;
            return true;
        };

        match service_address(service) {
            Some(address) => {
                debug!(source = %pass.name, %address, "service address published");
                status.address = Some(address);
                true
            }
            None => {
                debug!(source = %pass.name, "waiting for service address");
                status.address = None;
                false
            }
        }
    }

    async fn ensure_keys(&mut self, pass: &mut SyncPass<'_>) -> Result<bool, Error> {
        if let Some(name) = &self.spec.ssh_keys {
            let secret = pass
                .client
                .get_secret(&pass.namespace, name)
                .await?
                .ok_or_else(|| {
                    Error::missing_reference(&pass.name, "spec.rsync.sshKeys", "Secret", name)
                })?;
            validate_secret_keys(&secret, SOURCE_KEY_FIELDS)
                .map_err(|e| e.with_source_name(&pass.name))?;
            self.keys_secret = Some(name.clone());
            return Ok(true);
        }

        let result = self.ensure_generated_keys(pass).await;
        let status = pass
            .status
            .rsync
            .get_or_insert_with(ReplicationSourceRsyncStatus::default);
        match result {
            Ok(dest) => {
                status.ssh_keys = Some(dest);
                Ok(true)
            }
            Err(e) => {
                status.ssh_keys = None;
                Err(e)
            }
        }
    }

    /// Generate the keypairs once, then keep the split secrets in sync.
    /// Returns the destination secret's name.
    async fn ensure_generated_keys(&mut self, pass: &SyncPass<'_>) -> Result<String, Error> {
        let main_name = format!("scribe-rsync-src-main-{}", pass.name);
        let src_name = format!("scribe-rsync-src-src-{}", pass.name);
        let dest_name = format!("scribe-rsync-src-dest-{}", pass.name);
        debug!(source = %pass.name, secret = %main_name, "ensuring generated keys");

        let main = match pass.client.get_secret(&pass.namespace, &main_name).await? {
            Some(main) => main,
            None => {
                let (source, source_pub) = generate_keypair()?;
                let (destination, destination_pub) = generate_keypair()?;
                let main = Secret {
                    metadata: owned_meta(&main_name, pass.source)?,
                    string_data: Some(BTreeMap::from([
                        ("source".to_string(), source),
                        ("source.pub".to_string(), source_pub),
                        ("destination".to_string(), destination),
                        ("destination.pub".to_string(), destination_pub),
                    ])),
                    ..Default::default()
                };
                pass.client.create_secret(&pass.namespace, &main).await?;
                info!(source = %pass.name, secret = %main_name, "generated ssh keys");
                // Re-read: a concurrent pass may have won the create
                pass.client
                    .get_secret(&pass.namespace, &main_name)
                    .await?
                    .ok_or_else(|| Error::not_found("Secret", &main_name))?
            }
        };

        let src = derived_secret(pass, src_name.clone(), &main, SOURCE_KEY_FIELDS)?;
        pass.client.apply_secret(&pass.namespace, &src).await?;
        let dest = derived_secret(
            pass,
            dest_name.clone(),
            &main,
            &["destination", "destination.pub", "source.pub"],
        )?;
        pass.client.apply_secret(&pass.namespace, &dest).await?;

        self.keys_secret = Some(src_name);
        Ok(dest_name)
    }

    pub(crate) fn job_request(
        &self,
        pass: &SyncPass<'_>,
        data_volume: &str,
    ) -> Result<JobRequest, Error> {
        let keys = self.keys_secret.as_deref().ok_or_else(|| {
            Error::internal_with_context("rsync", "ssh keys not resolved before job")
        })?;

        let mut env_vars = Vec::new();
        if let Some(address) = &self.spec.address {
            env_vars.push(env("DESTINATION_ADDRESS", address.clone()));
        }
        if let Some(port) = self.spec.port {
            env_vars.push(env("DESTINATION_PORT", port.to_string()));
        }
        if let Some(path) = self.spec.path.as_deref().filter(|p| !p.is_empty()) {
            env_vars.push(env("DESTINATION_PATH", path));
        }
        if let Some(user) = self.spec.ssh_user.as_deref().filter(|u| !u.is_empty()) {
            env_vars.push(env("DESTINATION_USER", user));
        }

        let container = Container {
            name: "rsync".to_string(),
            image: Some(pass.images.rsync.clone()),
            command: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                "/source.sh".to_string(),
            ]),
            env: Some(env_vars),
            security_context: Some(root_security_context(&["AUDIT_WRITE", "SYS_CHROOT"])),
            volume_mounts: Some(vec![
                mount(DATA_VOLUME_NAME, DATA_MOUNT_PATH),
                mount(KEYS_VOLUME_NAME, KEYS_MOUNT_PATH),
            ]),
            ..Default::default()
        };

        Ok(JobRequest {
            pod_labels: selector_labels(&pass.name),
            containers: vec![container],
            volumes: vec![
                pvc_volume(DATA_VOLUME_NAME, data_volume),
                secret_volume(KEYS_VOLUME_NAME, keys),
            ],
            ..Default::default()
        })
    }
}
