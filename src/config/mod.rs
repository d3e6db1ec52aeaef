//! Configuration management for Vitrine
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files: renderer buffer sizing, descriptor heap capacities
//! and the defaults new windows are created with.

use crate::gpu::HeapKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration struct containing all Vitrine settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct VitrineConfig {
    /// Render thread and per-frame buffer settings
    #[serde(default)]
    pub renderer: RendererConfig,

    /// Initial descriptor heap capacities
    #[serde(default)]
    pub descriptors: DescriptorConfig,

    /// Defaults for newly created windows
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    /// Frames the CPU may record ahead of the GPU (ring slots per window)
    pub frames_in_flight: usize,

    /// Initial vertex buffer size per ring slot (bytes)
    pub vertex_capacity: u64,

    /// Initial index buffer size per ring slot (bytes)
    pub index_capacity: u64,

    /// Initial shape-property buffer size per ring slot (bytes)
    pub property_capacity: u64,

    /// Window messages that may queue before the UI thread blocks
    pub message_queue_capacity: usize,

    /// GPU backend ("headless", "wgpu")
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DescriptorConfig {
    pub shader_resource: u32,
    pub render_target: u32,
    pub depth_stencil: u32,
}

/// Window defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    /// Compose with the desktop using per-pixel alpha
    pub transparent: bool,

    /// Draw custom chrome instead of native decorations
    pub borderless: bool,

    /// Back buffers per swapchain
    pub swapchain_images: u32,

    /// Premultiplied RGBA clear colour
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            vertex_capacity: 64 * 1024,
            index_capacity: 16 * 1024,
            property_capacity: 16 * 1024,
            message_queue_capacity: 256,
            backend: "headless".to_string(),
        }
    }
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            shader_resource: 256,
            render_target: 64,
            depth_stencil: 16,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            transparent: true,
            borderless: true,
            swapchain_images: 2,
            clear_color: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

impl DescriptorConfig {
    /// Capacities in `HeapKind::index` order
    pub fn capacities(&self) -> [u32; 3] {
        let mut capacities = [0; 3];
        capacities[HeapKind::ShaderResource.index()] = self.shader_resource;
        capacities[HeapKind::RenderTarget.index()] = self.render_target;
        capacities[HeapKind::DepthStencil.index()] = self.depth_stencil;
        capacities
    }
}

const BACKENDS: [&str; 2] = ["headless", "wgpu"];

impl VitrineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: VitrineConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let renderer = &self.renderer;
        if !(1..=4).contains(&renderer.frames_in_flight) {
            anyhow::bail!(
                "Invalid frames_in_flight: {} (must be between 1 and 4)",
                renderer.frames_in_flight
            );
        }
        for (name, capacity) in [
            ("vertex_capacity", renderer.vertex_capacity),
            ("index_capacity", renderer.index_capacity),
            ("property_capacity", renderer.property_capacity),
        ] {
            if capacity == 0 {
                anyhow::bail!("Invalid {}: must be greater than 0", name);
            }
        }
        if renderer.message_queue_capacity == 0 {
            anyhow::bail!("Invalid message_queue_capacity: must be greater than 0");
        }
        if !BACKENDS.contains(&renderer.backend.as_str()) {
            anyhow::bail!("Invalid backend: {}", renderer.backend);
        }

        // Heap kinds reject these at creation; catch them with a readable error first
        let capacities = self.descriptors.capacities();
        for kind in HeapKind::ALL {
            let capacity = capacities[kind.index()];
            let max = kind.layout().max_slots;
            if capacity == 0 || capacity > max {
                anyhow::bail!(
                    "Invalid {:?} descriptor capacity: {} (must be between 1 and {})",
                    kind,
                    capacity,
                    max
                );
            }
        }

        if self.window.swapchain_images < 2 || self.window.swapchain_images > 4 {
            anyhow::bail!("Invalid swapchain_images: must be between 2 and 4");
        }
        if self
            .window
            .clear_color
            .iter()
            .any(|c| !(0.0..=1.0).contains(c))
        {
            anyhow::bail!("Invalid clear_color: components must be between 0.0 and 1.0");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Sections of `partial` that differ from the defaults override this config
    pub fn merge_partial(mut self, partial: VitrineConfig) -> Self {
        let default_config = VitrineConfig::default();

        if partial.renderer != default_config.renderer {
            self.renderer = partial.renderer;
        }
        if partial.descriptors != default_config.descriptors {
            self.descriptors = partial.descriptors;
        }
        if partial.window != default_config.window {
            self.window = partial.window;
        }

        self
    }
}

#[cfg(test)]
mod tests;
