use log::{debug, warn};

use crate::control_plane::ControlPlane;
use crate::error::{Error, Result};
use crate::schema::{ConfigSchema, Environment, Field};

/// Raw values of the `start` flags, `None` when not given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartFlags {
    pub config_file: Option<String>,
    pub provisioner_name: Option<String>,
    pub namespace: Option<String>,
    pub helper_image: Option<String>,
    pub kubeconfig: Option<String>,
}

/// Fully resolved settings of the provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    provisioner_name: String,
    namespace: String,
    helper_image: String,
    config_file: String,
    kubeconfig: Option<String>,
}

impl RuntimeConfig {
    pub fn provisioner_name(&self) -> &str {
        &self.provisioner_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn helper_image(&self) -> &str {
        &self.helper_image
    }

    /// A file path from the flag, or the ConfigMap value.
    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn kubeconfig(&self) -> Option<&str> {
        self.kubeconfig.as_deref()
    }
}

/// Resolves every field as flag, then environment, then built-in default.
///
/// The policy config has no default: without the flag it is read once from
/// the well-known ConfigMap in the resolved namespace.
pub async fn resolve<P>(
    schema: ConfigSchema,
    flags: &StartFlags,
    env: &Environment,
    plane: &P,
) -> Result<RuntimeConfig>
where
    P: ControlPlane + ?Sized,
{
    let provisioner_name = pick(schema.provisioner_name, flags.provisioner_name.as_deref(), env)?;
    let namespace = pick(schema.namespace, flags.namespace.as_deref(), env)?;
    let config_file = match non_empty(flags.config_file.as_deref()) {
        Some(path) => path.to_owned(),
        None => from_config_map(schema, &namespace, plane).await?,
    };
    let helper_image = pick(schema.helper_image, flags.helper_image.as_deref(), env)?;

    Ok(RuntimeConfig {
        provisioner_name,
        namespace,
        helper_image,
        config_file,
        kubeconfig: non_empty(flags.kubeconfig.as_deref()).map(str::to_owned),
    })
}

fn pick(field: Field, flag: Option<&str>, env: &Environment) -> Result<String> {
    non_empty(flag)
        .or_else(|| field.env.and_then(|key| env.get(key)))
        .or_else(|| non_empty(field.default))
        .map(str::to_owned)
        .ok_or_else(|| {
            let mut sources = vec![format!("flag --{}", field.flag)];
            if let Some(key) = field.env {
                sources.push(format!("env {}", key));
            }
            Error::missing(field.name, &sources)
        })
}

async fn from_config_map<P>(schema: ConfigSchema, namespace: &str, plane: &P) -> Result<String>
where
    P: ControlPlane + ?Sized,
{
    debug!(
        "flag --{} is empty, reading ConfigMap {}/{}",
        schema.config_file.flag, namespace, schema.config_map_name
    );

    let value = plane
        .config_map_value(namespace, schema.config_map_name, schema.config_map_key)
        .await;
    match value {
        Ok(Some(value)) if !value.is_empty() => Ok(value),
        Ok(_) => {
            warn!(
                "{} does not exist in ConfigMap {}/{}",
                schema.config_map_key, namespace, schema.config_map_name
            );
            Err(config_file_missing(schema, namespace))
        }
        Err(e) => {
            warn!(
                "failed to get ConfigMap {}/{}: {}",
                namespace, schema.config_map_name, e
            );
            Err(config_file_missing(schema, namespace))
        }
    }
}

fn config_file_missing(schema: ConfigSchema, namespace: &str) -> Error {
    Error::missing(
        schema.config_file.name,
        &[
            format!("flag --{}", schema.config_file.flag),
            format!(
                "ConfigMap {}/{} key {}",
                namespace, schema.config_map_name, schema.config_map_key
            ),
        ],
    )
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::version::Info;

    use super::*;

    /// In-memory control plane keyed by `namespace/name`.
    #[derive(Default)]
    pub(crate) struct FakePlane {
        pub(crate) config_maps: HashMap<String, HashMap<String, String>>,
        pub(crate) lookups: AtomicUsize,
    }

    impl FakePlane {
        pub(crate) fn with_config_map(namespace: &str, name: &str, key: &str, value: &str) -> Self {
            let mut plane = Self::default();
            plane.config_maps.insert(
                format!("{}/{}", namespace, name),
                HashMap::from([(key.to_owned(), value.to_owned())]),
            );
            plane
        }
    }

    #[async_trait]
    impl ControlPlane for FakePlane {
        async fn server_version(&self) -> Result<Info, kube::Error> {
            Ok(Info {
                git_version: "v1.25.3".into(),
                major: "1".into(),
                minor: "25".into(),
                ..Info::default()
            })
        }

        async fn config_map_value(
            &self,
            namespace: &str,
            name: &str,
            key: &str,
        ) -> Result<Option<String>, kube::Error> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match self.config_maps.get(&format!("{}/{}", namespace, name)) {
                Some(data) => Ok(data.get(key).cloned()),
                None => Err(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".into(),
                    message: format!("configmaps \"{}\" not found", name),
                    reason: "NotFound".into(),
                    code: 404,
                })),
            }
        }
    }

    fn flag(value: &str) -> Option<String> {
        Some(value.to_owned())
    }

    #[tokio::test]
    async fn flags_win_and_skip_cluster_lookup() {
        let plane = FakePlane::default();
        let env: Environment = [
            ("PROVISIONER_NAME", "env.io/provisioner"),
            ("POD_NAMESPACE", "env-ns"),
            ("HELPER_IMAGE", "busybox:env"),
        ]
        .into_iter()
        .collect();
        let flags = StartFlags {
            config_file: flag("/etc/cfg.json"),
            provisioner_name: flag("custom.io/provisioner"),
            namespace: flag("storage-ns"),
            helper_image: flag("busybox:1.0"),
            kubeconfig: None,
        };

        let config = resolve(ConfigSchema::default(), &flags, &env, &plane)
            .await
            .unwrap();

        assert_eq!(config.provisioner_name(), "custom.io/provisioner");
        assert_eq!(config.namespace(), "storage-ns");
        assert_eq!(config.helper_image(), "busybox:1.0");
        assert_eq!(config.config_file(), "/etc/cfg.json");
        assert_eq!(config.kubeconfig(), None);
        assert_eq!(plane.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn env_then_default() {
        let plane = FakePlane::default();
        let env: Environment = [("POD_NAMESPACE", "env-ns"), ("HELPER_IMAGE", "")]
            .into_iter()
            .collect();
        let flags = StartFlags {
            config_file: flag("/etc/cfg.json"),
            provisioner_name: flag(""),
            ..StartFlags::default()
        };

        let config = resolve(ConfigSchema::default(), &flags, &env, &plane)
            .await
            .unwrap();

        assert_eq!(config.provisioner_name(), "rancher.io/local-path");
        assert_eq!(config.namespace(), "env-ns");
        assert_eq!(config.helper_image(), "busybox");
    }

    #[test]
    fn precedence_over_every_source_combination() {
        let field = ConfigSchema::default().helper_image;
        for flag_set in [false, true] {
            for env_set in [false, true] {
                let env: Environment = if env_set {
                    [("HELPER_IMAGE", "from-env")].into_iter().collect()
                } else {
                    Environment::default()
                };
                let flag = flag_set.then_some("from-flag");
                let expected = match (flag_set, env_set) {
                    (true, _) => "from-flag",
                    (false, true) => "from-env",
                    (false, false) => "busybox",
                };
                assert_eq!(pick(field, flag, &env).unwrap(), expected);
            }
        }
    }

    #[test]
    fn field_without_any_source_is_missing() {
        let mut schema = ConfigSchema::default();
        schema.namespace.default = None;

        let err = pick(schema.namespace, Some(""), &Environment::default()).unwrap_err();
        match err {
            Error::MissingRequiredConfig { field, sources } => {
                assert_eq!(field, "namespace");
                assert_eq!(sources, "flag --namespace, env POD_NAMESPACE");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn config_file_falls_back_to_config_map() {
        let plane = FakePlane::with_config_map("storage-ns", "local-path-config", "config.json", "{}");
        let flags = StartFlags {
            namespace: flag("storage-ns"),
            ..StartFlags::default()
        };

        let config = resolve(ConfigSchema::default(), &flags, &Environment::default(), &plane)
            .await
            .unwrap();

        assert_eq!(config.config_file(), "{}");
        assert_eq!(plane.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_config_map_fails() {
        let plane = FakePlane::default();
        let flags = StartFlags {
            namespace: flag("storage-ns"),
            ..StartFlags::default()
        };

        let err = resolve(ConfigSchema::default(), &flags, &Environment::default(), &plane)
            .await
            .unwrap_err();

        match err {
            Error::MissingRequiredConfig { field, sources } => {
                assert_eq!(field, "configFile");
                assert!(sources.contains("flag --config"));
                assert!(sources.contains("storage-ns/local-path-config"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn missing_config_map_key_fails() {
        let plane = FakePlane::with_config_map("storage-ns", "local-path-config", "other.json", "{}");
        let flags = StartFlags {
            namespace: flag("storage-ns"),
            ..StartFlags::default()
        };

        let err = resolve(ConfigSchema::default(), &flags, &Environment::default(), &plane)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::MissingRequiredConfig {
                field: "configFile",
                ..
            }
        ));
    }
}
