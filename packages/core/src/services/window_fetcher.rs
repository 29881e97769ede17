//! Window Fetcher
//!
//! Turns a view into a [`WindowQuery`], answers it from the [`ResultCache`]
//! when possible and from the remote source otherwise. Transport failures of
//! these reads are retried with exponential backoff
//! (`retry_base_delay_ms * 2^attempt`).

use super::error::OverlayError;
use super::lod::LodPolicy;
use super::result_cache::{CacheLookup, CacheStats, ResultCache};
use crate::config::OverlayConfig;
use crate::graph::CuttingPlane;
use crate::models::{BoundingBox, Point3, RealNodeId, ResponseFormat, WindowQuery, ZRange};
use crate::remote::{normalize_payload, RemoteError, RemoteSource, WindowBatch, WindowRequest};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the viewer currently shows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    /// Project-space center; `z` is the displayed section
    pub center: Point3,
    pub width_px: f64,
    pub height_px: f64,
    /// Zoom factor; 2.0 shows every physical unit twice as large
    pub scale: f64,
    /// Physical units per screen pixel at scale 1
    pub resolution: f64,
    pub section_thickness: f64,
}

impl ViewState {
    pub fn section_z(&self) -> f64 {
        self.center.z
    }

    pub fn plane(&self) -> CuttingPlane {
        CuttingPlane::new(self.center.z)
    }

    /// Physical size of one screen pixel
    pub fn units_per_px(&self) -> f64 {
        self.resolution / self.scale
    }

    /// Visible rectangle grown by `padding_px` screen pixels on every side
    pub fn padded_box(&self, padding_px: f64) -> BoundingBox {
        let u = self.units_per_px();
        let half_w = (self.width_px / 2.0 + padding_px) * u;
        let half_h = (self.height_px / 2.0 + padding_px) * u;
        BoundingBox::new(
            self.center.x - half_w,
            self.center.y - half_h,
            self.center.x + half_w,
            self.center.y + half_h,
        )
    }

    /// Section z plus or minus half a section
    pub fn z_range(&self) -> ZRange {
        let half = self.section_thickness / 2.0;
        ZRange::new(self.center.z - half, self.center.z + half)
    }

    /// Same section, scale and viewport; only the center may differ
    fn same_frame(&self, other: &ViewState) -> bool {
        self.center.z == other.center.z
            && self.scale == other.scale
            && self.width_px == other.width_px
            && self.height_px == other.height_px
            && self.resolution == other.resolution
            && self.section_thickness == other.section_thickness
    }
}

/// Where a fetch result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FetchSource {
    Network,
    CacheExact,
    CacheEnclosing,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub batch: Arc<WindowBatch>,
    pub source: FetchSource,
    /// The remote hit its node-count ceiling
    pub truncated: bool,
}

pub struct WindowFetcher {
    remote: Arc<dyn RemoteSource>,
    cache: Mutex<ResultCache>,
    lod: LodPolicy,
    format: ResponseFormat,
    padding_px: f64,
    include_labels: bool,
    retries: u32,
    retry_base_delay: Duration,
}

impl WindowFetcher {
    pub fn new(remote: Arc<dyn RemoteSource>, config: &OverlayConfig) -> Self {
        Self {
            remote,
            cache: Mutex::new(ResultCache::new(&config.cache)),
            lod: config.lod.clone(),
            format: config.format,
            padding_px: config.padding_px,
            include_labels: config.include_labels,
            retries: config.fetch_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    fn cache(&self) -> MutexGuard<'_, ResultCache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Query for `view`, with explicit inclusions
    pub fn build_query(
        &self,
        view: &ViewState,
        treenode_ids: Vec<RealNodeId>,
        connector_ids: Vec<RealNodeId>,
    ) -> WindowQuery {
        WindowQuery::new(
            view.padded_box(self.padding_px),
            view.z_range(),
            self.lod.resolve(view.scale),
        )
        .with_labels(self.include_labels)
        .with_extra_ids(treenode_ids, connector_ids)
    }

    /// Whether moving from `previous` to `view` leaves the padded margin
    ///
    /// Only a pan by less than the padding in both directions avoids a fetch.
    pub fn needs_fetch(&self, previous: Option<&ViewState>, view: &ViewState) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        if !previous.same_frame(view) {
            return true;
        }
        let dx_px = (view.center.x - previous.center.x).abs() / view.units_per_px();
        let dy_px = (view.center.y - previous.center.y).abs() / view.units_per_px();
        !(dx_px < self.padding_px && dy_px < self.padding_px)
    }

    pub async fn fetch(&self, query: &WindowQuery) -> Result<FetchOutcome, OverlayError> {
        let lookup = self.cache().lookup(query);
        match lookup {
            CacheLookup::Exact(batch) => {
                return Ok(FetchOutcome {
                    truncated: batch.truncated,
                    batch,
                    source: FetchSource::CacheExact,
                });
            }
            CacheLookup::Enclosing(batch) => {
                return Ok(FetchOutcome {
                    truncated: false,
                    batch,
                    source: FetchSource::CacheEnclosing,
                });
            }
            CacheLookup::Miss => {}
        }

        let request = WindowRequest::from_query(query, self.format);
        let mut attempt: u32 = 0;
        let payload = loop {
            match self.remote.nodes_in_window(&request).await {
                Ok(payload) => {
                    if attempt > 0 {
                        tracing::debug!("Window fetch succeeded after {} retry(ies)", attempt);
                    }
                    break payload;
                }
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let backoff = self.retry_base_delay * 2u32.saturating_pow(attempt);
                    tracing::debug!(
                        "Window fetch attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt + 1,
                        self.retries + 1,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    if matches!(e, RemoteError::Transport(_)) {
                        tracing::warn!("Window fetch failed after {} attempt(s): {}", attempt + 1, e);
                    }
                    return Err(e.into());
                }
            }
        };

        let bytes = payload.byte_len();
        let batch = Arc::new(normalize_payload(&payload)?);
        if batch.truncated {
            tracing::warn!(
                "Did not retrieve all visible nodes: the node limit was reached ({} tree nodes, {} connectors)",
                batch.treenodes.len(),
                batch.connectors.len()
            );
        }
        self.cache().insert(query.clone(), batch.clone(), bytes);

        Ok(FetchOutcome {
            truncated: batch.truncated,
            batch,
            source: FetchSource::Network,
        })
    }

    /// Drop every cached response
    pub fn invalidate(&self) {
        self.cache().clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }
}
