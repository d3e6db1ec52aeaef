//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, serialization/deserialization,
//! and edge cases in configuration handling.

use super::*;
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() {
    let config = VitrineConfig::default();
    config.validate().unwrap();

    assert_eq!(config.renderer.frames_in_flight, 2);
    assert_eq!(config.renderer.backend, "headless");
    assert!(config.window.transparent);
    assert!(config.window.borderless);
    assert_eq!(config.window.swapchain_images, 2);
}

#[test]
fn test_configuration_serialization_roundtrip() -> Result<()> {
    let original_config = VitrineConfig {
        renderer: RendererConfig {
            vertex_capacity: 1024,
            ..Default::default()
        },
        ..Default::default()
    };

    let toml_string = toml::to_string(&original_config)?;
    let deserialized_config: VitrineConfig = toml::from_str(&toml_string)?;

    assert_eq!(original_config, deserialized_config);
    Ok(())
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("vitrine.toml");

    let test_config = r#"
[renderer]
frames_in_flight = 3
vertex_capacity = 1024
backend = "headless"

[descriptors]
render_target = 8

[window]
transparent = false
clear_color = [0.1, 0.1, 0.1, 1.0]
"#;
    fs::write(&file_path, test_config)?;

    let config = VitrineConfig::load(&file_path)?;
    assert_eq!(config.renderer.frames_in_flight, 3);
    assert_eq!(config.renderer.vertex_capacity, 1024);
    // unspecified keys fall back to defaults
    assert_eq!(config.renderer.index_capacity, 16 * 1024);
    assert_eq!(config.descriptors.render_target, 8);
    assert_eq!(config.descriptors.shader_resource, 256);
    assert!(!config.window.transparent);
    assert!(config.window.borderless);
    assert_eq!(config.window.clear_color, [0.1, 0.1, 0.1, 1.0]);

    Ok(())
}

#[test]
fn test_empty_file_gives_defaults() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("empty.toml");
    fs::write(&file_path, "")?;

    assert_eq!(VitrineConfig::load(&file_path)?, VitrineConfig::default());
    Ok(())
}

#[test]
fn test_missing_file_is_an_error() {
    let result = VitrineConfig::load("/nonexistent/vitrine.toml");
    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("Failed to read config file"));
}

#[test]
fn test_malformed_toml_is_an_error() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("bad.toml");
    fs::write(&file_path, "[renderer\nframes_in_flight = ")?;

    let message = format!("{:#}", VitrineConfig::load(&file_path).unwrap_err());
    assert!(message.contains("Failed to parse config file"));
    Ok(())
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut config = VitrineConfig::default();
    config.renderer.frames_in_flight = 0;
    assert!(config.validate().is_err());

    let mut config = VitrineConfig::default();
    config.renderer.vertex_capacity = 0;
    assert!(config.validate().is_err());

    let mut config = VitrineConfig::default();
    config.renderer.backend = "vulkan".to_string();
    assert!(config.validate().is_err());

    let mut config = VitrineConfig::default();
    config.renderer.message_queue_capacity = 0;
    assert!(config.validate().is_err());

    let mut config = VitrineConfig::default();
    config.window.swapchain_images = 1;
    assert!(config.validate().is_err());

    let mut config = VitrineConfig::default();
    config.window.clear_color = [0.0, 0.0, 0.0, 1.5];
    assert!(config.validate().is_err());
}

#[test]
fn test_descriptor_capacity_bounds() {
    let mut config = VitrineConfig::default();
    config.descriptors.depth_stencil = 0;
    assert!(config.validate().is_err());

    config.descriptors.depth_stencil = HeapKind::DepthStencil.layout().max_slots;
    assert!(config.validate().is_ok());

    config.descriptors.depth_stencil += 1;
    assert!(config.validate().is_err());
}

#[test]
fn test_capacities_follow_heap_kind_order() {
    let config = DescriptorConfig {
        shader_resource: 1,
        render_target: 2,
        depth_stencil: 3,
    };
    let capacities = config.capacities();
    assert_eq!(capacities[HeapKind::ShaderResource.index()], 1);
    assert_eq!(capacities[HeapKind::RenderTarget.index()], 2);
    assert_eq!(capacities[HeapKind::DepthStencil.index()], 3);
}

#[test]
fn test_save_then_load() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");
    let mut config = VitrineConfig::default();
    config.renderer.backend = "wgpu".to_string();
    config.window.swapchain_images = 3;

    config.save(&file_path)?;
    assert_eq!(VitrineConfig::load(&file_path)?, config);
    Ok(())
}

#[test]
fn test_merge_partial_overrides_changed_sections() {
    let base = VitrineConfig {
        window: WindowConfig {
            transparent: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let partial = VitrineConfig {
        renderer: RendererConfig {
            frames_in_flight: 3,
            ..Default::default()
        },
        ..Default::default()
    };

    let merged = base.merge_partial(partial);
    assert_eq!(merged.renderer.frames_in_flight, 3);
    // untouched section keeps the base value
    assert!(!merged.window.transparent);
}
