use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Namespace holding the images ConfigMap, also the namespace whose
    /// ConfigMaps are watched.
    pub namespace: String,
    /// Name of the ConfigMap carrying builderImage/deployerImage entries.
    pub images_config_map: String,
    /// Well-known name of the pre-existing operator resource.
    pub resource_name: String,
    pub rate_limiter: RateLimiterSettings,
    pub webserver: Webserver,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "config-observer".to_string(),
            images_config_map: "controller-manager-images".to_string(),
            resource_name: "instance".to_string(),
            rate_limiter: RateLimiterSettings::default(),
            webserver: Webserver::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimiterSettings {
    // roughly three reconciliations per minute after the initial burst
    fn default() -> Self {
        Self { qps: 0.05, burst: 4 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    info!("Loading settings from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read settings file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let settings = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML settings after environment variable expansion")?;

    Ok(settings)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error if any env var is missing or regex fails.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| panic!("Missing environment variable: {}", var_name))
    });

    Ok(result.into_owned())
}
