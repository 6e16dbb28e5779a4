use std::fmt::Display;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::version::Info;
use log::{debug, info};

use crate::config::{self, RuntimeConfig, StartFlags};
use crate::connection;
use crate::control_plane::ControlPlane;
use crate::controller::ProvisionController;
use crate::error::{Error, Result};
use crate::provisioner::LocalPathProvisioner;
use crate::schema::{ConfigSchema, Environment};
use crate::shutdown::ShutdownSignal;

/// Process level state, advanced strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Starting,
    ConnectingControlPlane,
    ResolvingConfig,
    Running,
    ShuttingDown,
    Stopped,
}

/// A long running loop that returns once `shutdown` has fired.
#[async_trait]
pub trait ProvisioningLoop: Send {
    async fn run(self, shutdown: ShutdownSignal);
}

#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
    history: Vec<Phase>,
    shutdown: ShutdownSignal,
}

impl Lifecycle {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            phase: Phase::Starting,
            history: vec![Phase::Starting],
            shutdown,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, oldest first.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    fn enter(&mut self, next: Phase) {
        if self.phase != next {
            debug!("{:?} -> {:?}", self.phase, next);
            self.phase = next;
            self.history.push(next);
        }
    }

    pub async fn connect(
        &mut self,
        flags: &StartFlags,
        schema: ConfigSchema,
        env: &Environment,
    ) -> Result<kube::Client> {
        self.connect_with(flags, schema, env, kube::Config::incluster)
            .await
    }

    /// Like [`Lifecycle::connect`] with the in-cluster lookup supplied by the caller.
    pub async fn connect_with<F, E>(
        &mut self,
        flags: &StartFlags,
        schema: ConfigSchema,
        env: &Environment,
        in_cluster: F,
    ) -> Result<kube::Client>
    where
        F: FnOnce() -> Result<kube::Config, E>,
        E: Display,
    {
        self.enter(Phase::ConnectingControlPlane);
        let hint = flags.kubeconfig.as_deref().unwrap_or_default();
        let connection = connection::resolve_with(hint, schema, env, in_cluster).await?;
        debug!(
            "connecting to {} ({:?})",
            connection.cluster_url(),
            connection.source()
        );
        connection.client()
    }

    /// Fails fast when the API server cannot be reached or does not answer.
    pub async fn check_server_version<P>(&mut self, plane: &P) -> Result<Info>
    where
        P: ControlPlane + ?Sized,
    {
        self.enter(Phase::ConnectingControlPlane);
        let version = plane
            .server_version()
            .await
            .map_err(Error::ControlPlaneIncompatible)?;
        info!("Kubernetes server version {}", version.git_version);
        Ok(version)
    }

    pub async fn resolve_config<P>(
        &mut self,
        schema: ConfigSchema,
        flags: &StartFlags,
        env: &Environment,
        plane: &P,
    ) -> Result<RuntimeConfig>
    where
        P: ControlPlane + ?Sized,
    {
        self.enter(Phase::ResolvingConfig);
        let config = config::resolve(schema, flags, env, plane).await?;
        debug!("resolved {:?}", config);
        Ok(config)
    }

    /// Blocks in `Running` until the loop returns, which it does after the
    /// shutdown signal fires.
    pub async fn run<L: ProvisioningLoop>(&mut self, provisioning: L) -> Phase {
        self.enter(Phase::Running);
        debug!("Provisioner started");

        let shutdown = self.shutdown.clone();
        let run = provisioning.run(self.shutdown.clone());
        tokio::pin!(run);

        // a fired signal always goes through ShuttingDown, even when the loop
        // is ready in the same poll
        tokio::select! {
            biased;
            _ = shutdown.fired() => {
                self.enter(Phase::ShuttingDown);
                run.await;
            }
            _ = &mut run => {
                if shutdown.is_fired() {
                    self.enter(Phase::ShuttingDown);
                }
            }
        }

        debug!("Provisioner stopped");
        self.enter(Phase::Stopped);
        self.phase
    }
}

/// Connects, checks the server version, resolves configuration and runs the
/// local path provisioner until `shutdown` fires.
pub async fn start(flags: StartFlags, env: Environment, shutdown: ShutdownSignal) -> Result<()> {
    start_with(flags, env, shutdown, kube::Config::incluster).await
}

pub async fn start_with<F, E>(
    flags: StartFlags,
    env: Environment,
    shutdown: ShutdownSignal,
    in_cluster: F,
) -> Result<()>
where
    F: FnOnce() -> Result<kube::Config, E>,
    E: Display,
{
    let schema = ConfigSchema::default();
    let mut lifecycle = Lifecycle::new(shutdown);

    let client = lifecycle
        .connect_with(&flags, schema, &env, in_cluster)
        .await?;
    let version = lifecycle.check_server_version(&client).await?;
    let config = lifecycle
        .resolve_config(schema, &flags, &env, &client)
        .await?;

    let provisioner = LocalPathProvisioner::new(client.clone(), &config)?;
    let controller = ProvisionController::new(
        client,
        config.provisioner_name(),
        provisioner,
        version.git_version,
    );

    lifecycle.run(controller).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::*;
    use crate::config::tests::FakePlane;
    use crate::shutdown::tests::{fired_signal, never_fired_signal};
    use crate::shutdown::{arm_with, Interrupt};

    /// Stands in for the controller: waits for the signal like the real loop.
    struct WaitForShutdown {
        observed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProvisioningLoop for WaitForShutdown {
        async fn run(self, shutdown: ShutdownSignal) {
            shutdown.fired().await;
            self.observed.store(true, Ordering::SeqCst);
        }
    }

    struct ReturnsEarly;

    #[async_trait]
    impl ProvisioningLoop for ReturnsEarly {
        async fn run(self, _shutdown: ShutdownSignal) {}
    }

    fn flags() -> StartFlags {
        StartFlags {
            namespace: Some("storage-ns".into()),
            ..StartFlags::default()
        }
    }

    #[tokio::test]
    async fn phases_advance_to_stopped() {
        let plane = FakePlane::with_config_map("storage-ns", "local-path-config", "config.json", "{}");
        let mut lifecycle = Lifecycle::new(fired_signal());
        assert_eq!(lifecycle.phase(), Phase::Starting);

        let version = lifecycle.check_server_version(&plane).await.unwrap();
        assert_eq!(version.git_version, "v1.25.3");
        assert_eq!(lifecycle.phase(), Phase::ConnectingControlPlane);

        let config = lifecycle
            .resolve_config(ConfigSchema::default(), &flags(), &Environment::default(), &plane)
            .await
            .unwrap();
        assert_eq!(config.config_file(), "{}");
        assert_eq!(lifecycle.phase(), Phase::ResolvingConfig);

        let observed = Arc::new(AtomicBool::new(false));
        let phase = lifecycle
            .run(WaitForShutdown {
                observed: observed.clone(),
            })
            .await;
        assert_eq!(phase, Phase::Stopped);
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(
            lifecycle.history(),
            [
                Phase::Starting,
                Phase::ConnectingControlPlane,
                Phase::ResolvingConfig,
                Phase::Running,
                Phase::ShuttingDown,
                Phase::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn fired_signal_passes_through_shutting_down() {
        // the loop is ready in the same poll as the signal
        for _ in 0..64 {
            let mut lifecycle = Lifecycle::new(fired_signal());
            lifecycle.run(ReturnsEarly).await;
            assert_eq!(
                lifecycle.history(),
                [
                    Phase::Starting,
                    Phase::Running,
                    Phase::ShuttingDown,
                    Phase::Stopped,
                ]
            );
        }
    }

    #[tokio::test]
    async fn missing_kubeconfig_stops_while_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("kubeconfig");
        let flags = StartFlags {
            kubeconfig: Some(missing.to_string_lossy().into_owned()),
            ..StartFlags::default()
        };
        let mut lifecycle = Lifecycle::new(never_fired_signal());

        let err = lifecycle
            .connect_with(&flags, ConfigSchema::default(), &Environment::default(), || {
                Err::<kube::Config, _>("not running in a cluster")
            })
            .await
            .err()
            .expect("connect_with should fail");

        assert!(matches!(err, Error::ConfigNotFound(ref path) if *path == missing));
        assert_eq!(err.exit_code(), 66);
        assert_eq!(
            lifecycle.history(),
            [Phase::Starting, Phase::ConnectingControlPlane]
        );
    }

    #[tokio::test]
    async fn interrupt_during_resolution_is_not_lost() {
        let (tx, rx) = oneshot::channel();
        let shutdown = arm_with(async move { rx.await.ok() });
        let plane = FakePlane::with_config_map("storage-ns", "local-path-config", "config.json", "{}");
        let mut lifecycle = Lifecycle::new(shutdown);

        lifecycle.check_server_version(&plane).await.unwrap();
        tx.send(Interrupt::Terminate).unwrap();
        lifecycle
            .resolve_config(ConfigSchema::default(), &flags(), &Environment::default(), &plane)
            .await
            .unwrap();

        let observed = Arc::new(AtomicBool::new(false));
        let phase = timeout(
            Duration::from_secs(1),
            lifecycle.run(WaitForShutdown {
                observed: observed.clone(),
            }),
        )
        .await
        .expect("run loop hung after an early interrupt");
        assert_eq!(phase, Phase::Stopped);
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn loop_returning_on_its_own_still_stops() {
        let mut lifecycle = Lifecycle::new(never_fired_signal());
        let phase = timeout(Duration::from_secs(1), lifecycle.run(ReturnsEarly))
            .await
            .unwrap();
        assert_eq!(phase, Phase::Stopped);
        assert_eq!(
            lifecycle.history(),
            [Phase::Starting, Phase::Running, Phase::Stopped]
        );
    }

    #[tokio::test]
    async fn failed_fallback_stops_before_running() {
        let plane = FakePlane::default();
        let mut lifecycle = Lifecycle::new(never_fired_signal());

        let err = lifecycle
            .resolve_config(ConfigSchema::default(), &flags(), &Environment::default(), &plane)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingRequiredConfig { .. }));
        assert_eq!(lifecycle.phase(), Phase::ResolvingConfig);
    }
}
