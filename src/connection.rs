use std::fmt::Display;
use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use log::debug;

use crate::error::{Error, Result};
use crate::schema::{ConfigSchema, Environment};

/// Where the control plane credentials came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSource {
    InCluster,
    Kubeconfig(PathBuf),
}

/// Resolved, not yet connected, control plane session parameters.
#[derive(Debug, Clone)]
pub struct Connection {
    config: kube::Config,
    source: ConnectionSource,
}

impl Connection {
    pub fn source(&self) -> &ConnectionSource {
        &self.source
    }

    pub fn cluster_url(&self) -> String {
        self.config.cluster_url.to_string()
    }

    pub fn client(self) -> Result<kube::Client> {
        kube::Client::try_from(self.config)
            .map_err(|e| Error::Connection(format!("unable to get k8s client: {}", e)))
    }
}

/// Prefers the in-cluster service account and only then looks at a kubeconfig file.
pub async fn resolve(hint: &str, schema: ConfigSchema, env: &Environment) -> Result<Connection> {
    resolve_with(hint, schema, env, kube::Config::incluster).await
}

pub async fn resolve_with<F, E>(
    hint: &str,
    schema: ConfigSchema,
    env: &Environment,
    in_cluster: F,
) -> Result<Connection>
where
    F: FnOnce() -> Result<kube::Config, E>,
    E: Display,
{
    match in_cluster() {
        Ok(config) => {
            debug!("using in-cluster config for {}", config.cluster_url);
            return Ok(Connection {
                config,
                source: ConnectionSource::InCluster,
            });
        }
        Err(e) => debug!("in-cluster config unavailable: {}", e),
    }

    let path = credentials_path(hint, schema, env).ok_or_else(|| {
        Error::Connection(format!(
            "flag --{} is empty and there is no home directory to look in",
            schema.kubeconfig.flag
        ))
    })?;
    from_file(&path).await
}

/// The flag value when given, otherwise the default path under the home directory.
pub fn credentials_path(hint: &str, schema: ConfigSchema, env: &Environment) -> Option<PathBuf> {
    if !hint.is_empty() {
        return Some(PathBuf::from(hint));
    }
    env.home_dir()
        .map(|home| Path::new(home).join(schema.default_kubeconfig_path))
}

async fn from_file(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(Error::ConfigNotFound(path.to_path_buf()));
    }

    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::Connection(format!("failed to read kubeconfig {}: {}", path.display(), e))
    })?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::Connection(format!("failed to load kubeconfig {}: {}", path.display(), e))
        })?;

    debug!("using kubeconfig {}", path.display());
    Ok(Connection {
        config,
        source: ConnectionSource::Kubeconfig(path.to_path_buf()),
    })
}
