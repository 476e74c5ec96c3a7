use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::observed_config::{ObservedConfig, set_nested_field};
use crate::operator_config::ConfigMapReader;

/// A pure transform folding cluster facts into the configuration snapshot.
///
/// Observers run in a fixed order; each receives the previous one's output, so a
/// later observer may override an earlier one. The first error aborts the pipeline
/// and the partial snapshot is discarded, nothing is written externally.
#[async_trait]
pub trait Observe: Send + Sync {
    async fn observe(
        &self,
        reader: &dyn ConfigMapReader,
        observed: ObservedConfig,
    ) -> Result<ObservedConfig>;
}

/// Observes builder and deployer image references from the images ConfigMap in
/// order to determine which image template formats the controller manager uses.
pub struct ImagesObserver {
    config_map: String,
}

impl ImagesObserver {
    pub fn new(config_map: impl Into<String>) -> Self {
        Self {
            config_map: config_map.into(),
        }
    }
}

#[async_trait]
impl Observe for ImagesObserver {
    async fn observe(
        &self,
        reader: &dyn ConfigMapReader,
        mut observed: ObservedConfig,
    ) -> Result<ObservedConfig> {
        // a missing ConfigMap leaves the snapshot untouched
        let Some(data) = reader
            .get(&self.config_map)
            .await
            .map_err(|source| Error::Observe { source })?
        else {
            return Ok(observed);
        };

        if let Some(image) = data.get("builderImage").filter(|v| !v.is_empty()) {
            set_nested_field(
                &mut observed,
                image.clone(),
                &["build", "imageTemplateFormat", "format"],
            );
        }
        if let Some(image) = data.get("deployerImage").filter(|v| !v.is_empty()) {
            set_nested_field(
                &mut observed,
                image.clone(),
                &["deployer", "imageTemplateFormat", "format"],
            );
        }

        Ok(observed)
    }
}
