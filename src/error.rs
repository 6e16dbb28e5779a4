use std::path::PathBuf;

use thiserror::Error;

/// Exit status for command line misuse.
pub const EXIT_USAGE: i32 = 64;
const EXIT_NO_INPUT: i32 = 66;
const EXIT_UNAVAILABLE: i32 = 69;
const EXIT_CONFIG: i32 = 78;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to get client config: {0}")]
    Connection(String),
    #[error("kubeconfig not found: {}", .0.display())]
    ConfigNotFound(PathBuf),
    #[error("missing required config {field}, tried {sources}")]
    MissingRequiredConfig { field: &'static str, sources: String },
    #[error("Cannot start Provisioner: failed to get Kubernetes server version: {0}")]
    ControlPlaneIncompatible(#[source] kube::Error),
    #[error("invalid policy config: {0}")]
    InvalidPolicyConfig(String),
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

impl Error {
    /// Process exit status for this error, all of them are fatal at startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MissingRequiredConfig { .. } | Error::InvalidPolicyConfig(_) => EXIT_CONFIG,
            Error::ConfigNotFound(_) => EXIT_NO_INPUT,
            Error::Connection(_) | Error::ControlPlaneIncompatible(_) => EXIT_UNAVAILABLE,
            Error::Provisioning(_) | Error::Kube(_) | Error::Signal(_) => 1,
        }
    }

    pub(crate) fn missing(field: &'static str, sources: &[String]) -> Self {
        Error::MissingRequiredConfig {
            field,
            sources: sources.join(", "),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
