use std::fmt::Debug;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::observed_config::{ObservedConfig, changed_paths};
use crate::observer::{ImagesObserver, Observe};
use crate::operator_config::{
    ConfigMapReader, ConfigStore, KubeConfigMapReader, KubeConfigStore, OperatorConfig,
};
use crate::queue::WorkQueue;
use crate::rate_limiter::RateLimiter;

/// The one sentinel key the queue ever carries. Every pass recomputes everything
/// from scratch, so the triggering event's identity is irrelevant.
const WORK_QUEUE_KEY: &str = "instance";

pub async fn create_client() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to in-cluster Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Watch-triggered control loop keeping `spec.observedConfig` on the operator
/// resource in sync with facts observed from the cluster.
pub struct ConfigObserver {
    store: Arc<dyn ConfigStore>,
    reader: Arc<dyn ConfigMapReader>,
    observers: Vec<Box<dyn Observe>>,
    resource_name: String,
    // the queue only ever holds one logical item, but it brings coalescing and
    // backoff/retry semantics for free
    queue: Arc<WorkQueue<&'static str>>,
    rate_limiter: RateLimiter,
}

impl ConfigObserver {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        reader: Arc<dyn ConfigMapReader>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            reader,
            observers: vec![Box::new(ImagesObserver::new(
                settings.images_config_map.clone(),
            ))],
            resource_name: settings.resource_name.clone(),
            queue: Arc::new(WorkQueue::new()),
            rate_limiter: RateLimiter::new(settings.rate_limiter.qps, settings.rate_limiter.burst),
        }
    }

    pub fn from_client(client: Client, settings: &Settings) -> Self {
        Self::new(
            Arc::new(KubeConfigStore::new(client.clone())),
            Arc::new(KubeConfigMapReader::new(client, &settings.namespace)),
            settings,
        )
    }

    pub fn event_bridge(&self) -> EventBridge {
        EventBridge {
            queue: Arc::clone(&self.queue),
        }
    }

    /// One reconciliation pass: fold the observer pipeline into a fresh snapshot,
    /// compare against the persisted one and write only on change.
    pub async fn sync(&self) -> Result<()> {
        let mut observed = ObservedConfig::new();
        for observer in &self.observers {
            observed = observer.observe(self.reader.as_ref(), observed).await?;
        }

        let mut resource = self.store.get(&self.resource_name).await?;

        // an unreadable persisted blob never aborts the pass; the write below
        // self-heals it
        let current = match &resource.spec.observed_config {
            Value::Object(map) => map.clone(),
            Value::Null => ObservedConfig::new(),
            other => {
                warn!(
                    "Persisted observedConfig is not an object ({}), treating it as empty",
                    value_kind(other)
                );
                ObservedConfig::new()
            }
        };

        if current == observed {
            return Ok(());
        }

        info!(
            "Writing updated observedConfig, changed paths: {:?}",
            changed_paths(&current, &observed)
        );
        resource.spec.observed_config = Value::Object(observed);
        self.store.update(resource).await?;

        Ok(())
    }

    /// Runs the worker loop until `shutdown` fires and the in-flight pass, if
    /// any, has completed.
    ///
    /// Exactly one worker is spawned no matter what `workers` says: the
    /// at-most-one-reconciliation-in-flight guarantee depends on it.
    pub async fn run(&self, workers: usize, shutdown: CancellationToken) {
        if workers != 1 {
            warn!("Ignoring requested worker count {workers}, running a single worker");
        }
        info!("Starting config observer");

        {
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                shutdown.cancelled().await;
                queue.shut_down();
            });
        }

        // prime the queue so the first pass does not wait for a watch event
        self.queue.add(WORK_QUEUE_KEY);

        while self.process_next_work_item().await {}
        info!("Shutting down config observer");
    }

    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        // wait for a token before syncing to avoid hot-looping against the
        // API server on event bursts
        self.rate_limiter.accept().await;

        match self.sync().await {
            Ok(()) => self.queue.forget(&key),
            Err(err) => {
                error!("{key} failed with: {err}");
                Arc::clone(&self.queue).add_rate_limited(key);
            }
        }
        self.queue.done(&key);

        true
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Adapts watch notifications into queue enqueues. Every event of every kind
/// collapses into the same sentinel key; this layer inspects no payloads.
#[derive(Clone)]
pub struct EventBridge {
    queue: Arc<WorkQueue<&'static str>>,
}

impl EventBridge {
    pub fn on_add(&self) {
        self.queue.add(WORK_QUEUE_KEY);
    }

    pub fn on_update(&self) {
        self.queue.add(WORK_QUEUE_KEY);
    }

    pub fn on_delete(&self) {
        self.queue.add(WORK_QUEUE_KEY);
    }
}

/// Watches the two triggering populations, the cluster-scoped operator resource
/// and the ConfigMaps of the operator namespace, and forwards every notification
/// through the bridge.
pub async fn watch_sources(
    client: Client,
    namespace: String,
    bridge: EventBridge,
    shutdown: CancellationToken,
) {
    let operator_configs: Api<OperatorConfig> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::namespaced(client, &namespace);

    tokio::join!(
        forward_events(operator_configs, bridge.clone(), shutdown.clone()),
        forward_events(config_maps, bridge, shutdown),
    );
}

async fn forward_events<K>(api: Api<K>, bridge: EventBridge, shutdown: CancellationToken)
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
{
    let mut events = pin!(watcher(api, watcher::Config::default()).default_backoff());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(watcher::Event::InitApply(_))) => bridge.on_add(),
                Some(Ok(watcher::Event::Apply(_))) => bridge.on_update(),
                Some(Ok(watcher::Event::Delete(_))) => bridge.on_delete(),
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!("Watch stream error: {err}"),
                None => break,
            }
        }
    }
}
