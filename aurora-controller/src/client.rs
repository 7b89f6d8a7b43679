//! The writes the controllers issue against the cluster
use async_trait::async_trait;
use aurora_runtime::ObjectKey;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{
    api::{Api, PostParams},
    Client,
};

/// Mutating calls made by the sync handlers
///
/// Reads always go through the informer caches, so this only covers writes.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Replaces the service account at `key`, subject to its resource version
    async fn replace_service_account(&self, key: &ObjectKey, sa: &ServiceAccount) -> kube::Result<ServiceAccount>;

    /// Creates `secret` in `namespace`
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> kube::Result<Secret>;

    /// Replaces the secret at `key`, subject to its resource version
    async fn replace_secret(&self, key: &ObjectKey, secret: &Secret) -> kube::Result<Secret>;
}

/// [`ClusterApi`] backed by the API server
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    /// Writes through `client`
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeApi {
    async fn replace_service_account(&self, key: &ObjectKey, sa: &ServiceAccount) -> kube::Result<ServiceAccount> {
        Api::<ServiceAccount>::namespaced(self.client.clone(), key.namespace_or_default())
            .replace(&key.name, &PostParams::default(), sa)
            .await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> kube::Result<Secret> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), secret)
            .await
    }

    async fn replace_secret(&self, key: &ObjectKey, secret: &Secret) -> kube::Result<Secret> {
        Api::<Secret>::namespaced(self.client.clone(), key.namespace_or_default())
            .replace(&key.name, &PostParams::default(), secret)
            .await
    }
}
