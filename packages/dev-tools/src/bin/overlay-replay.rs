//! Overlay Replay Binary
//!
//! Drives a tracing overlay through a scripted session against the
//! in-memory remote and prints the resulting statistics as JSON. Useful for
//! eyeballing log output and request ordering without a real annotation
//! server.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p skeletrace-dev-tools --bin overlay-replay
//!
//! # With a config file and simulated network latency
//! REPLAY_CONFIG=overlay.json REPLAY_LATENCY_MS=25 RUST_LOG=debug \
//!     cargo run -p skeletrace-dev-tools --bin overlay-replay
//! ```
//!
//! # Environment Variables
//!
//! - `REPLAY_CONFIG`: Overlay config file (default: built-in defaults)
//! - `REPLAY_LATENCY_MS`: Delay added to every remote request (default: 0)
//! - `REPLAY_SKELETONS`: Number of synthetic skeletons (default: 20)
//! - `RUST_LOG`: Logging level (e.g., "info", "debug", "trace")

use std::env;
use std::sync::Arc;
use std::time::Duration;

use skeletrace_core::config::OverlayConfig;
use skeletrace_core::remote::InMemoryRemote;
use skeletrace_core::services::{TracingOverlay, ViewState};
use skeletrace_core::{NodeId, Point3};

/// Nodes per synthetic skeleton; consecutive nodes sit one section apart
const NODES_PER_SKELETON: i64 = 12;

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Straight skeletons climbing through the stack, one per x offset
fn seed(remote: &InMemoryRemote, skeletons: i64) {
    for s in 0..skeletons {
        let base = s * NODES_PER_SKELETON;
        for n in 0..NODES_PER_SKELETON {
            let id = base + n + 1;
            let parent = if n == 0 { None } else { Some(id - 1) };
            let position = Point3::new(20.0 * s as f64, 10.0 * n as f64, n as f64);
            remote.seed_treenode(id, parent, position, Some(2.0), s + 1);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("🧠 Skeletrace overlay replay");

    let config = match env::var("REPLAY_CONFIG") {
        Ok(path) => {
            tracing::info!("📄 Config: {}", path);
            OverlayConfig::load(&path).await?
        }
        Err(_) => OverlayConfig::default(),
    };
    let latency = env_number("REPLAY_LATENCY_MS", 0u64);
    let skeletons = env_number("REPLAY_SKELETONS", 20i64);

    let mut remote = InMemoryRemote::new();
    if latency > 0 {
        remote = remote.with_latency(Duration::from_millis(latency));
    }
    seed(&remote, skeletons);
    let remote = Arc::new(remote);
    tracing::info!("📦 Seeded {} nodes in {} skeletons", remote.node_count(), skeletons);

    let overlay = TracingOverlay::new(remote.clone(), config)?;
    let mut events = overlay.subscribe();

    let mut view = ViewState {
        center: Point3::new(200.0, 60.0, 0.5),
        width_px: 800.0,
        height_px: 600.0,
        scale: 1.0,
        resolution: 1.0,
        section_thickness: 1.0,
    };

    // Step through the stack, half a section off the node planes so every
    // edge in range is split by a virtual node
    for section in 0..4 {
        view.center.z = section as f64 + 0.5;
        let outcome = overlay.refresh(&view).await?;
        let virtuals = overlay.store().await.stats().virtual_nodes;
        tracing::info!(
            "Section {}: {:?}, {} virtual node(s)",
            view.center.z,
            outcome.source,
            virtuals
        );
    }

    // Drag one virtual node, then let the flush realize it
    let first_virtual = overlay
        .store()
        .await
        .virtual_nodes()
        .first()
        .map(|n| (n.id, n.position));
    if let Some((id, position)) = first_virtual {
        let moved = Point3::new(position.x + 3.0, position.y, position.z);
        overlay.move_node(id, moved).await?;
        let report = overlay.flush().await?;
        tracing::info!("✏️  Flushed: {} realized, {} moved", report.realized.len(), report.moved.len());
    }

    // Zoom in on the same section
    view.scale = 2.0;
    let outcome = overlay.refresh(&view).await?;
    tracing::info!("Zoomed in: {:?}", outcome.source);

    // Delete a node of the first skeleton lying in the current section
    let doomed = NodeId::Real(4);
    if overlay.node(&doomed).await.is_some() {
        let deleted = overlay.delete_node(doomed).await?;
        tracing::info!("🗑️  Deleted node 4, children now under {:?}", deleted.parent_id);
    }

    let mut event_count = 0;
    while let Ok(event) = events.try_recv() {
        tracing::debug!("Event {}", event.event_type());
        event_count += 1;
    }

    let stats = overlay.stats().await;
    tracing::info!("✅ Replay finished with {} event(s)", event_count);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
