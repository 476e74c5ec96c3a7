use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::PostParams;
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cluster-scoped operator resource carrying the persisted configuration snapshot
/// in `spec.observedConfig`. The blob is opaque to everything except the sync pass.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[kube(
    group = "config-observer.dev",
    version = "v1alpha1",
    kind = "OperatorConfig",
    plural = "operatorconfigs"
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfigSpec {
    /// Last written configuration snapshot. Defaults to null, which reads as empty.
    #[serde(default)]
    pub observed_config: serde_json::Value,
}

/// Read access to a namespace-scoped ConfigMap's key/value data.
///
/// Not-found is `Ok(None)`, distinguishable from transport or API errors. Data is
/// fetched fresh on every call, never cached.
#[async_trait]
pub trait ConfigMapReader: Send + Sync {
    async fn get(&self, name: &str) -> kube::Result<Option<BTreeMap<String, String>>>;
}

pub struct KubeConfigMapReader {
    api: Api<ConfigMap>,
}

impl KubeConfigMapReader {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ConfigMapReader for KubeConfigMapReader {
    async fn get(&self, name: &str) -> kube::Result<Option<BTreeMap<String, String>>> {
        Ok(self.api.get_opt(name).await?.and_then(|cm| cm.data))
    }
}

/// Read and conditionally write the operator resource.
///
/// `update` is an optimistic-concurrency write keyed by the resource's own
/// resourceVersion; a conflicting concurrent writer surfaces as [`Error::Update`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<OperatorConfig>;
    async fn update(&self, config: OperatorConfig) -> Result<OperatorConfig>;
}

pub struct KubeConfigStore {
    api: Api<OperatorConfig>,
}

impl KubeConfigStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    async fn get(&self, name: &str) -> Result<OperatorConfig> {
        self.api
            .get(name)
            .await
            .map_err(|source| Error::Fetch { source })
    }

    async fn update(&self, config: OperatorConfig) -> Result<OperatorConfig> {
        let name = config.metadata.name.clone().unwrap_or_default();
        self.api
            .replace(&name, &PostParams::default(), &config)
            .await
            .map_err(|source| Error::Update { source })
    }
}
