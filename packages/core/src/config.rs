//! Overlay configuration
//!
//! Loaded from a JSON file; every field has a default so partial files (or no
//! file at all) work.

use crate::models::{ResponseFormat, UserId};
use crate::services::LodPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of cached responses
    pub capacity: usize,
    /// Approximate memory bound over all cached responses
    pub max_bytes: usize,
    /// Serve a request from a cached response for an enclosing box
    pub reuse_enclosing: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 32,
            max_bytes: 64 * 1024 * 1024,
            reuse_enclosing: true,
        }
    }
}

/// Who is editing, and whose nodes they may change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub user_id: UserId,
    /// Other users whose nodes this session may edit
    pub editable_user_ids: Vec<UserId>,
    pub superuser: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: 1,
            editable_user_ids: Vec::new(),
            superuser: false,
        }
    }
}

impl SessionConfig {
    /// Whether a node created by `creator_id` may be changed
    ///
    /// Nodes with an unknown creator are editable.
    pub fn can_edit(&self, creator_id: Option<UserId>) -> bool {
        match creator_id {
            None => true,
            Some(creator) => {
                self.superuser || creator == self.user_id || self.editable_user_ids.contains(&creator)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OverlayConfig {
    /// Screen pixels fetched beyond each viewport edge
    pub padding_px: f64,
    pub lod: LodPolicy,
    pub include_labels: bool,
    pub format: ResponseFormat,
    pub cache: CacheConfig,
    /// Extra attempts for a window fetch after a transport failure
    pub fetch_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Retained node objects per kind between rebuilds
    pub node_pool_limit: usize,
    pub session: SessionConfig,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            padding_px: 256.0,
            lod: LodPolicy::default(),
            include_labels: false,
            format: ResponseFormat::Json,
            cache: CacheConfig::default(),
            fetch_retries: 2,
            retry_base_delay_ms: 10,
            node_pool_limit: 5_000,
            session: SessionConfig::default(),
        }
    }
}

impl OverlayConfig {
    /// Load from a JSON file, using defaults when it does not exist
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !fs::try_exists(path)
            .await
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?
        {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.padding_px.is_finite() || self.padding_px < 0.0 {
            return Err(ConfigError::invalid(
                "paddingPx",
                "must be a non-negative number",
            ));
        }

        if self.format == ResponseFormat::Raster {
            return Err(ConfigError::invalid(
                "format",
                "raster responses carry no graph data",
            ));
        }

        if let LodPolicy::Adaptive {
            min_zoom, max_zoom, ..
        } = &self.lod
        {
            if !(*min_zoom > 0.0 && max_zoom > min_zoom) {
                return Err(ConfigError::invalid(
                    "lod",
                    "adaptive zoom range must satisfy 0 < minZoom < maxZoom",
                ));
            }
        }

        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(ConfigError::invalid(
                "cache.capacity",
                "must be greater than 0 when the cache is enabled",
            ));
        }

        if self.fetch_retries > 10 {
            return Err(ConfigError::invalid("fetchRetries", "cannot exceed 10"));
        }

        Ok(())
    }
}
