use std::collections::HashMap;

/// One configurable value: where it can come from and what it falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub flag: &'static str,
    pub env: Option<&'static str>,
    pub default: Option<&'static str>,
}

/// Names and defaults of everything the `start` command reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSchema {
    pub config_file: Field,
    pub provisioner_name: Field,
    pub namespace: Field,
    pub helper_image: Field,
    pub kubeconfig: Field,
    pub config_map_name: &'static str,
    pub config_map_key: &'static str,
    /// Relative to the home directory.
    pub default_kubeconfig_path: &'static str,
}

impl Default for ConfigSchema {
    fn default() -> Self {
        Self {
            config_file: Field {
                name: "configFile",
                flag: "config",
                env: None,
                default: None,
            },
            provisioner_name: Field {
                name: "provisionerName",
                flag: "provisioner-name",
                env: Some("PROVISIONER_NAME"),
                default: Some("rancher.io/local-path"),
            },
            namespace: Field {
                name: "namespace",
                flag: "namespace",
                env: Some("POD_NAMESPACE"),
                default: Some("local-path-storage"),
            },
            helper_image: Field {
                name: "helperImage",
                flag: "helper-image",
                env: Some("HELPER_IMAGE"),
                default: Some("busybox"),
            },
            kubeconfig: Field {
                name: "kubeconfig",
                flag: "kubeconfig",
                env: None,
                default: None,
            },
            config_map_name: "local-path-config",
            config_map_key: "config.json",
            default_kubeconfig_path: ".kube/config",
        }
    }
}

/// Read-only snapshot of environment variables. Empty values count as unset.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn home_dir(&self) -> Option<&str> {
        self.get("HOME").or_else(|| self.get("USERPROFILE"))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
