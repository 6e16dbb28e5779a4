use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::{
    core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim},
    storage::v1::StorageClass,
};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, ResourceExt},
    runtime::controller::{Action, Controller},
};
use log::{debug, error, info, warn};
use tokio::time::Duration;

use crate::error::{Error, Result};
use crate::lifecycle::ProvisioningLoop;
use crate::shutdown::ShutdownSignal;

pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";

const RECLAIM_DELETE: &str = "Delete";
const PHASE_RELEASED: &str = "Released";

/// Everything a provisioner needs to create one volume.
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub volume_name: String,
    pub claim: PersistentVolumeClaim,
    pub storage_class: StorageClass,
    pub selected_node: Option<String>,
}

/// Storage backend callbacks driven by [`ProvisionController`].
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Creates the backing storage and returns the volume to register.
    async fn provision(&self, options: ProvisionOptions) -> Result<PersistentVolume>;

    /// Removes the backing storage of a released volume.
    async fn delete(&self, volume: &PersistentVolume) -> Result<()>;
}

/// Watches claims and volumes and calls the provisioner for the ones that
/// belong to `name`.
pub struct ProvisionController<P> {
    client: kube::Client,
    name: String,
    provisioner: P,
    server_version: String,
}

impl<P: Provisioner> ProvisionController<P> {
    pub fn new(
        client: kube::Client,
        name: impl Into<String>,
        provisioner: P,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            client,
            name: name.into(),
            provisioner,
            server_version: server_version.into(),
        }
    }
}

#[async_trait]
impl<P: Provisioner> ProvisioningLoop for ProvisionController<P> {
    /// Runs until `shutdown` fires, then drains in-flight reconciles.
    async fn run(self, shutdown: ShutdownSignal) {
        info!(
            "provision controller {} running against Kubernetes {}",
            self.name, self.server_version
        );

        let client = self.client;
        let ctx = Arc::new(Data {
            client: client.clone(),
            name: self.name,
            provisioner: self.provisioner,
        });

        let claims = {
            let client = client.clone();
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                Controller::new(Api::<PersistentVolumeClaim>::all(client), ListParams::default())
                    .graceful_shutdown_on(shutdown.fired_owned())
                    .run(reconcile_claim, error_policy, ctx)
                    .for_each(|res| async move {
                        if let Err(e) = res {
                            warn!("claim reconcile failed: {}", e)
                        }
                    })
                    .await;
            })
        };

        let volumes = tokio::spawn(async move {
            Controller::new(Api::<PersistentVolume>::all(client), ListParams::default())
                .graceful_shutdown_on(shutdown.fired_owned())
                .run(reconcile_volume, error_policy, ctx)
                .for_each(|res| async move {
                    if let Err(e) = res {
                        warn!("volume reconcile failed: {}", e)
                    }
                })
                .await;
        });

        let (claims, volumes) = futures::join!(claims, volumes);
        for res in [claims, volumes] {
            if let Err(e) = res {
                error!("controller task failed: {}", e);
            }
        }
    }
}

// Data we want access to in error/reconcile calls
struct Data<P> {
    client: kube::Client,
    name: String,
    provisioner: P,
}

async fn reconcile_claim<P: Provisioner>(
    claim: Arc<PersistentVolumeClaim>,
    ctx: Arc<Data<P>>,
) -> Result<Action> {
    let class_name = match pending_class(&claim) {
        Some(class_name) => class_name,
        None => return Ok(Action::await_change()),
    };

    let classes = Api::<StorageClass>::all(ctx.client.clone());
    let class = match classes.get_opt(class_name).await? {
        Some(class) => class,
        None => {
            debug!("storage class {} not found yet", class_name);
            return Ok(Action::requeue(Duration::from_secs(60)));
        }
    };
    if class.provisioner != ctx.name {
        return Ok(Action::await_change());
    }

    let volume_name = volume_name(&claim)?;
    let volumes = Api::<PersistentVolume>::all(ctx.client.clone());
    if volumes.get_opt(&volume_name).await?.is_some() {
        debug!("volume {} already exists", volume_name);
        return Ok(Action::await_change());
    }

    let options = ProvisionOptions {
        volume_name,
        selected_node: claim.annotations().get(ANN_SELECTED_NODE).cloned(),
        claim: claim.as_ref().clone(),
        storage_class: class,
    };
    let mut volume = ctx.provisioner.provision(options).await?;
    bind_to_claim(&mut volume, &claim, &ctx.name);

    volumes.create(&PostParams::default(), &volume).await?;
    info!(
        "volume {} provisioned for claim {}/{}",
        volume.name_any(),
        claim.namespace().unwrap_or_default(),
        claim.name_any()
    );

    Ok(Action::await_change())
}

async fn reconcile_volume<P: Provisioner>(
    volume: Arc<PersistentVolume>,
    ctx: Arc<Data<P>>,
) -> Result<Action> {
    if !should_delete(&volume, &ctx.name) {
        return Ok(Action::await_change());
    }

    ctx.provisioner.delete(&volume).await?;

    let volumes = Api::<PersistentVolume>::all(ctx.client.clone());
    match volumes
        .delete(&volume.name_any(), &DeleteParams::default())
        .await
    {
        Ok(_) => info!("volume {} deleted", volume.name_any()),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    Ok(Action::await_change())
}

/// The controller triggers this on reconcile errors
fn error_policy<K, P>(_object: Arc<K>, _error: &Error, _ctx: Arc<Data<P>>) -> Action {
    Action::requeue(Duration::from_secs(60))
}

/// Storage class of an unbound, not deleted claim.
fn pending_class(claim: &PersistentVolumeClaim) -> Option<&str> {
    if claim.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let spec = claim.spec.as_ref()?;
    if spec.volume_name.as_deref().map_or(false, |v| !v.is_empty()) {
        return None;
    }
    spec.storage_class_name.as_deref().filter(|c| !c.is_empty())
}

fn volume_name(claim: &PersistentVolumeClaim) -> Result<String> {
    claim
        .uid()
        .map(|uid| format!("pvc-{}", uid))
        .ok_or_else(|| Error::Provisioning(format!("claim {} has no uid", claim.name_any())))
}

fn bind_to_claim(volume: &mut PersistentVolume, claim: &PersistentVolumeClaim, name: &str) {
    volume
        .annotations_mut()
        .insert(ANN_PROVISIONED_BY.to_owned(), name.to_owned());

    let spec = volume.spec.get_or_insert_with(Default::default);
    spec.claim_ref = Some(ObjectReference {
        api_version: Some("v1".to_owned()),
        kind: Some("PersistentVolumeClaim".to_owned()),
        namespace: claim.namespace(),
        name: Some(claim.name_any()),
        uid: claim.uid(),
        resource_version: claim.resource_version(),
        ..ObjectReference::default()
    });
}

fn should_delete(volume: &PersistentVolume, name: &str) -> bool {
    let released = volume
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some(PHASE_RELEASED);
    let reclaim_delete = volume
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        == Some(RECLAIM_DELETE);
    let ours = volume.annotations().get(ANN_PROVISIONED_BY).map(String::as_str) == Some(name);

    released && reclaim_delete && ours && volume.metadata.deletion_timestamp.is_none()
}
