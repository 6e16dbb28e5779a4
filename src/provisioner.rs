use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeSpec, Pod, PodSpec, Toleration, Volume, VolumeMount,
    VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, PostParams, ResourceExt},
    runtime::wait::await_condition,
};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::time::{self, Duration};

use crate::config::RuntimeConfig;
use crate::controller::{ProvisionOptions, Provisioner};
use crate::error::{Error, Result};

/// Node entry applied to every node without its own entry.
pub const DEFAULT_NODE: &str = "DEFAULT_PATH_FOR_NON_LISTED_NODES";

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
const HELPER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigData {
    #[serde(default)]
    node_path_map: Vec<NodePathMapData>,
}

#[derive(Debug, Deserialize)]
struct NodePathMapData {
    node: String,
    paths: Vec<String>,
}

/// Validated node to base directories mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    node_paths: BTreeMap<String, Vec<PathBuf>>,
}

impl PolicyConfig {
    /// `source` is read as a file when it names one, otherwise taken as inline JSON.
    pub fn load(source: &str) -> Result<Self> {
        let path = Path::new(source);
        if path.is_file() {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                Error::InvalidPolicyConfig(format!("cannot read {}: {}", path.display(), e))
            })?;
            return Self::parse(&raw);
        }
        if source.trim_start().starts_with('{') {
            return Self::parse(source);
        }
        Err(Error::InvalidPolicyConfig(format!(
            "{} is neither a file nor inline JSON",
            source
        )))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let data: ConfigData =
            serde_json::from_str(raw).map_err(|e| Error::InvalidPolicyConfig(e.to_string()))?;

        let mut node_paths = BTreeMap::new();
        for entry in data.node_path_map {
            if node_paths.contains_key(&entry.node) {
                return Err(Error::InvalidPolicyConfig(format!(
                    "duplicate node {}",
                    entry.node
                )));
            }

            let mut seen = HashSet::new();
            let mut paths = Vec::with_capacity(entry.paths.len());
            for raw_path in entry.paths {
                let trimmed = raw_path.trim_end_matches('/');
                if trimmed.is_empty() && !raw_path.is_empty() {
                    return Err(Error::InvalidPolicyConfig(format!(
                        "cannot use root ('/') as path on node {}",
                        entry.node
                    )));
                }
                let path = PathBuf::from(trimmed);
                if !path.is_absolute() {
                    return Err(Error::InvalidPolicyConfig(format!(
                        "path {} of node {} must be absolute",
                        raw_path, entry.node
                    )));
                }
                if !seen.insert(path.clone()) {
                    return Err(Error::InvalidPolicyConfig(format!(
                        "duplicate path {} on node {}",
                        raw_path, entry.node
                    )));
                }
                paths.push(path);
            }
            node_paths.insert(entry.node, paths);
        }

        Ok(Self { node_paths })
    }

    /// First base directory configured for `node`, or for [`DEFAULT_NODE`].
    pub fn path_for(&self, node: &str) -> Option<&Path> {
        self.node_paths
            .get(node)
            .or_else(|| self.node_paths.get(DEFAULT_NODE))
            .and_then(|paths| paths.first())
            .map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HelperAction {
    Create,
    Delete,
}

impl fmt::Display for HelperAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelperAction::Create => f.write_str("create"),
            HelperAction::Delete => f.write_str("delete"),
        }
    }
}

/// Provisions volumes as directories on the node selected by the scheduler.
pub struct LocalPathProvisioner {
    client: kube::Client,
    namespace: String,
    helper_image: String,
    config: PolicyConfig,
}

impl LocalPathProvisioner {
    pub fn new(client: kube::Client, config: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            client,
            namespace: config.namespace().to_owned(),
            helper_image: config.helper_image().to_owned(),
            config: PolicyConfig::load(config.config_file())?,
        })
    }

    async fn run_helper(
        &self,
        action: HelperAction,
        node: &str,
        path: &Path,
        volume_name: &str,
    ) -> Result<()> {
        let pod = helper_pod(action, node, path, volume_name, &self.helper_image, &self.namespace)?;
        let name = pod.name_any();
        let pods = Api::<Pod>::namespaced(self.client.clone(), &self.namespace);

        pods.create(&PostParams::default(), &pod).await?;
        debug!("helper pod {} started on {}", name, node);

        let finished = time::timeout(
            HELPER_TIMEOUT,
            await_condition(pods.clone(), &name, pod_finished),
        )
        .await;

        if let Err(e) = pods.delete(&name, &DeleteParams::default()).await {
            warn!("failed to delete helper pod {}: {}", name, e);
        }

        let pod = match finished {
            Ok(Ok(pod)) => pod,
            Ok(Err(e)) => {
                return Err(Error::Provisioning(format!(
                    "waiting for helper pod {}: {}",
                    name, e
                )))
            }
            Err(_) => {
                return Err(Error::Provisioning(format!(
                    "helper pod {} did not finish within {:?}",
                    name, HELPER_TIMEOUT
                )))
            }
        };
        match pod_phase(pod.as_ref()) {
            Some("Succeeded") => Ok(()),
            phase => Err(Error::Provisioning(format!(
                "helper pod {} to {} {} ended in phase {}",
                name,
                action,
                path.display(),
                phase.unwrap_or("Unknown")
            ))),
        }
    }
}

#[async_trait]
impl Provisioner for LocalPathProvisioner {
    async fn provision(&self, options: ProvisionOptions) -> Result<PersistentVolume> {
        let node = options.selected_node.as_deref().ok_or_else(|| {
            Error::Provisioning(format!(
                "configuration error, no node was specified for claim {}",
                options.claim.name_any()
            ))
        })?;
        let base = self.config.path_for(node).ok_or_else(|| {
            Error::Provisioning(format!("no local path available on node {}", node))
        })?;
        let path = base.join(folder_name(&options));

        info!(
            "creating volume {} at {}:{}",
            options.volume_name,
            node,
            path.display()
        );
        self.run_helper(HelperAction::Create, node, &path, &options.volume_name)
            .await?;

        volume_for(&options, node, &path)
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let (node, path) = volume_location(volume).ok_or_else(|| {
            Error::Provisioning(format!(
                "volume {} has no host path or node affinity",
                volume.name_any()
            ))
        })?;

        info!(
            "deleting volume {} at {}:{}",
            volume.name_any(),
            node,
            path.display()
        );
        self.run_helper(HelperAction::Delete, &node, &path, &volume.name_any())
            .await
    }
}

fn folder_name(options: &ProvisionOptions) -> String {
    format!(
        "{}_{}_{}",
        options.volume_name,
        options.claim.namespace().unwrap_or_default(),
        options.claim.name_any()
    )
}

fn volume_for(options: &ProvisionOptions, node: &str, path: &Path) -> Result<PersistentVolume> {
    let claim_spec = options.claim.spec.clone().unwrap_or_default();
    let storage = claim_spec
        .resources
        .and_then(|r| r.requests)
        .and_then(|mut requests| requests.remove("storage"))
        .ok_or_else(|| {
            Error::Provisioning(format!(
                "claim {} has no storage request",
                options.claim.name_any()
            ))
        })?;

    Ok(PersistentVolume {
        metadata: ObjectMeta {
            name: Some(options.volume_name.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([("storage".to_owned(), storage)])),
            access_modes: claim_spec.access_modes,
            volume_mode: claim_spec.volume_mode,
            persistent_volume_reclaim_policy: Some(
                options
                    .storage_class
                    .reclaim_policy
                    .clone()
                    .unwrap_or_else(|| "Delete".to_owned()),
            ),
            storage_class_name: options.storage_class.metadata.name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: path.display().to_string(),
                type_: Some("DirectoryOrCreate".to_owned()),
            }),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: HOSTNAME_LABEL.to_owned(),
                            operator: "In".to_owned(),
                            values: Some(vec![node.to_owned()]),
                        }]),
                        ..NodeSelectorTerm::default()
                    }],
                }),
            }),
            ..PersistentVolumeSpec::default()
        }),
        ..PersistentVolume::default()
    })
}

/// Node and directory of a volume created by [`volume_for`].
fn volume_location(volume: &PersistentVolume) -> Option<(String, PathBuf)> {
    let spec = volume.spec.as_ref()?;
    let path = PathBuf::from(&spec.host_path.as_ref()?.path);
    let node = spec
        .node_affinity
        .as_ref()?
        .required
        .as_ref()?
        .node_selector_terms
        .iter()
        .flat_map(|term| term.match_expressions.iter().flatten())
        .find(|req| req.key == HOSTNAME_LABEL && req.operator == "In")?
        .values
        .as_ref()?
        .first()?
        .clone();
    Some((node, path))
}

fn helper_pod(
    action: HelperAction,
    node: &str,
    path: &Path,
    volume_name: &str,
    image: &str,
    namespace: &str,
) -> Result<Pod> {
    let parent = path
        .parent()
        .filter(|p| p.parent().is_some())
        .ok_or_else(|| {
            Error::Provisioning(format!(
                "refusing to {} {}: no base directory",
                action,
                path.display()
            ))
        })?;
    let target = path.display().to_string();
    let command = match action {
        HelperAction::Create => vec!["mkdir", "-m", "0777", "-p", target.as_str()],
        HelperAction::Delete => vec!["rm", "-rf", target.as_str()],
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(format!("helper-{}-{}", action, volume_name)),
            namespace: Some(namespace.to_owned()),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_owned()),
            restart_policy: Some("Never".to_owned()),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_owned()),
                ..Toleration::default()
            }]),
            containers: vec![Container {
                name: format!("local-path-{}", action),
                image: Some(image.to_owned()),
                command: Some(command.into_iter().map(str::to_owned).collect()),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_owned(),
                    mount_path: parent.display().to_string(),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_owned(),
                host_path: Some(HostPathVolumeSource {
                    path: parent.display().to_string(),
                    type_: Some("DirectoryOrCreate".to_owned()),
                }),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    })
}

fn pod_phase(pod: Option<&Pod>) -> Option<&str> {
    pod?.status.as_ref()?.phase.as_deref()
}

fn pod_finished(pod: Option<&Pod>) -> bool {
    matches!(pod_phase(pod), Some("Succeeded") | Some("Failed"))
}
