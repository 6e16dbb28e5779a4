//! Dynamic provisioning of node local hostPath volumes.
//!
//! Startup resolves a control plane connection, checks the API server version,
//! resolves the runtime configuration and then runs the provisioning
//! controller until SIGINT or SIGTERM.

pub mod config;
pub mod connection;
pub mod control_plane;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod provisioner;
pub mod schema;
pub mod shutdown;

pub use config::{RuntimeConfig, StartFlags};
pub use connection::{Connection, ConnectionSource};
pub use control_plane::ControlPlane;
pub use controller::{ProvisionController, ProvisionOptions, Provisioner};
pub use error::{Error, Result};
pub use lifecycle::{Lifecycle, Phase, ProvisioningLoop};
pub use provisioner::{LocalPathProvisioner, PolicyConfig};
pub use schema::{ConfigSchema, Environment};
pub use shutdown::ShutdownSignal;
