use async_trait::async_trait;
use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::version::Info};
use kube::Api;

/// The few control plane reads needed before the controller starts.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn server_version(&self) -> Result<Info, kube::Error>;

    /// `Ok(None)` when the ConfigMap exists but has no such key.
    async fn config_map_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, kube::Error>;
}

#[async_trait]
impl ControlPlane for kube::Client {
    async fn server_version(&self) -> Result<Info, kube::Error> {
        self.apiserver_version().await
    }

    async fn config_map_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, kube::Error> {
        let cm = Api::<ConfigMap>::namespaced(self.clone(), namespace)
            .get(name)
            .await?;
        Ok(cm.data.and_then(|mut data| data.remove(key)))
    }
}
