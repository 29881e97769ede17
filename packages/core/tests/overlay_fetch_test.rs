//! Overlay Fetch Tests
//!
//! Window fetching through the overlay: virtual node derivation at the
//! displayed section, padding-aware refresh decisions, cache reuse,
//! truncation reporting and file-based configuration.

#[cfg(test)]
mod overlay_fetch_tests {
    use anyhow::Result;
    use skeletrace_core::config::OverlayConfig;
    use skeletrace_core::remote::InMemoryRemote;
    use skeletrace_core::services::{FetchSource, OverlayEvent, TracingOverlay, ViewState};
    use skeletrace_core::{NodeId, Point3, VirtualNodeId};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn view(x: f64, y: f64, z: f64) -> ViewState {
        ViewState {
            center: Point3::new(x, y, z),
            width_px: 100.0,
            height_px: 100.0,
            scale: 1.0,
            resolution: 1.0,
            section_thickness: 1.0,
        }
    }

    fn setup(remote: InMemoryRemote) -> Result<(Arc<InMemoryRemote>, TracingOverlay)> {
        let remote = Arc::new(remote);
        let overlay = TracingOverlay::new(remote.clone(), OverlayConfig::default())?;
        Ok((remote, overlay))
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<OverlayEvent>) -> Vec<OverlayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_edge_crossing_section_is_split_by_virtual_node() -> Result<()> {
        let (remote, overlay) = setup(InMemoryRemote::new())?;
        remote.seed_treenode(2, None, Point3::new(10.0, 10.0, 0.0), None, 1);
        remote.seed_treenode(1, Some(2), Point3::new(30.0, 30.0, 1.0), None, 1);

        let outcome = overlay.refresh(&view(50.0, 50.0, 0.5)).await?;
        assert!(outcome.applied);
        assert_eq!(outcome.source, FetchSource::Network);

        let store = overlay.store().await;
        let virtuals = store.virtual_nodes();
        assert_eq!(virtuals.len(), 1);
        let vn = *virtuals[0].id.as_virtual().unwrap();
        assert_eq!(vn.child(), 1);
        assert_eq!(vn.parent(), 2);
        assert_eq!(virtuals[0].position, Point3::new(20.0, 20.0, 0.5));
        assert_eq!(vn.to_string(), "vn:1:2:20:20:0.5");

        assert_eq!(store.parent_of(&NodeId::Real(1)), Some(&NodeId::Virtual(vn)));
        assert_eq!(store.parent_of(&NodeId::Virtual(vn)), Some(&NodeId::Real(2)));
        assert_eq!(store.children_of(&NodeId::Real(2)), &[NodeId::Virtual(vn)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_virtual_node_between_out_of_range_endpoints() -> Result<()> {
        let (remote, overlay) = setup(InMemoryRemote::new())?;
        remote.seed_treenode(9, None, Point3::new(1.0, 2.0, 4.0), None, 1);
        remote.seed_treenode(5, Some(9), Point3::new(1.0, 2.0, 2.0), None, 1);

        overlay.refresh(&view(1.0, 2.0, 3.0)).await?;

        let vn: VirtualNodeId = "vn:5:9:1:2:3".parse()?;
        let store = overlay.store().await;
        assert!(store.contains(&NodeId::Virtual(vn)));
        assert_eq!(store.stats().virtual_nodes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pan_within_padding_does_not_need_refresh() -> Result<()> {
        let (remote, overlay) = setup(InMemoryRemote::new())?;
        remote.seed_treenode(1, None, Point3::new(50.0, 50.0, 0.5), None, 1);
        let start = view(50.0, 50.0, 0.5);

        assert!(overlay.needs_refresh(&start));
        overlay.refresh(&start).await?;

        assert!(!overlay.needs_refresh(&view(150.0, 0.0, 0.5)));
        assert!(overlay.needs_refresh(&view(350.0, 50.0, 0.5)));
        assert!(overlay.needs_refresh(&view(50.0, 50.0, 1.5)));
        Ok(())
    }

    #[tokio::test]
    async fn test_zoom_in_is_served_from_enclosing_cache_entry() -> Result<()> {
        let (remote, overlay) = setup(InMemoryRemote::new())?;
        remote.seed_treenode(1, None, Point3::new(50.0, 50.0, 0.5), None, 1);
        remote.seed_treenode(2, Some(1), Point3::new(55.0, 50.0, 0.5), None, 1);

        overlay.refresh(&view(50.0, 50.0, 0.5)).await?;
        let mut zoomed = view(50.0, 50.0, 0.5);
        zoomed.scale = 2.0;
        assert!(overlay.needs_refresh(&zoomed));

        let outcome = overlay.refresh(&zoomed).await?;
        assert_eq!(outcome.source, FetchSource::CacheEnclosing);
        assert_eq!(remote.calls("nodes_in_window"), 1);
        assert_eq!(overlay.store().await.len(), 2);

        let stats = overlay.stats().await;
        assert_eq!(stats.cache.enclosing_hits, 1);
        assert_eq!(stats.generation, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cache() -> Result<()> {
        let (remote, overlay) = setup(InMemoryRemote::new())?;
        remote.seed_treenode(1, None, Point3::new(50.0, 50.0, 0.5), None, 1);
        let v = view(50.0, 50.0, 0.5);

        overlay.refresh(&v).await?;
        overlay
            .create_node(Some(NodeId::Real(1)), Point3::new(60.0, 50.0, 0.5), None, Default::default())
            .await?;

        let outcome = overlay.refresh(&v).await?;
        assert_eq!(outcome.source, FetchSource::Network);
        assert_eq!(remote.calls("nodes_in_window"), 2);
        assert_eq!(overlay.store().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_truncated_response_raises_warning() -> Result<()> {
        let (remote, overlay) = setup(InMemoryRemote::new().with_node_limit(2))?;
        for id in 1..=5 {
            remote.seed_treenode(id, None, Point3::new(10.0 * id as f64, 50.0, 0.5), None, id);
        }
        let mut rx = overlay.subscribe();

        let outcome = overlay.refresh(&view(50.0, 50.0, 0.5)).await?;
        assert!(outcome.truncated);
        assert_eq!(overlay.store().await.len(), 2);

        let events = drain(&mut rx);
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["graph:truncated", "warning", "graph:rebuilt"]);
        match &events[1] {
            OverlayEvent::Warning { message } => {
                assert!(message.starts_with("Did not retrieve all visible nodes"));
            }
            other => panic!("expected warning, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_active_node_is_fetched_even_outside_window() -> Result<()> {
        let (remote, overlay) = setup(InMemoryRemote::new())?;
        remote.seed_treenode(1, None, Point3::new(50.0, 50.0, 0.5), None, 1);
        overlay.refresh(&view(50.0, 50.0, 0.5)).await?;
        overlay.activate(&NodeId::Real(1), Some("xy".to_string())).await?;

        overlay.refresh(&view(5000.0, 5000.0, 0.5)).await?;
        assert!(overlay.node(&NodeId::Real(1)).await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_config_file_drives_overlay() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("overlay.json");
        std::fs::write(
            &path,
            r#"{ "paddingPx": 20, "cache": { "enabled": false } }"#,
        )?;
        let config = OverlayConfig::load(&path).await?;
        assert_eq!(config.padding_px, 20.0);

        let remote = Arc::new(InMemoryRemote::new());
        let overlay = TracingOverlay::new(remote.clone(), config)?;
        let v = view(50.0, 50.0, 0.5);
        overlay.refresh(&v).await?;
        overlay.refresh(&v).await?;
        assert_eq!(remote.calls("nodes_in_window"), 2);
        assert!(overlay.needs_refresh(&view(75.0, 50.0, 0.5)));

        let missing = OverlayConfig::load(temp_dir.path().join("missing.json")).await?;
        assert_eq!(missing, OverlayConfig::default());
        Ok(())
    }
}
