// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Every section is optional; missing keys fall back to the defaults below.

use crate::accel::AccelerationOptions;
use crate::gpu::BuildPreference;
use crate::renderer::RendererDesc;
use crate::scene::{Motion, Placement};
use anyhow::{Context, Result};
use glam::Vec3;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub descriptors: DescriptorConfig,
    pub raytracing: RayTracingConfig,
    pub debug: DebugConfig,
    pub scene: SceneConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "RT Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Frames in flight; also the requested swapchain image count
    pub frame_count: usize,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.4, 1.0],
            frame_count: 3,
            vertex_shader: PathBuf::from("shaders/instance.vert.spv"),
            fragment_shader: PathBuf::from("shaders/instance.frag.spv"),
        }
    }
}

/// Shader-visible descriptor heap sizing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    pub persistent_capacity: u32,
    /// Also the maximum number of objects drawn per frame
    pub transient_capacity_per_frame: u32,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            persistent_capacity: 64,
            transient_capacity_per_frame: 4096,
        }
    }
}

/// Acceleration structure build settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RayTracingConfig {
    /// "fast_trace" or "fast_build"
    pub preference: String,
    pub allow_update: bool,
    pub instance_mask: u8,
}

impl Default for RayTracingConfig {
    fn default() -> Self {
        Self {
            preference: "fast_trace".to_string(),
            allow_update: true,
            instance_mask: 0xFF,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    /// Seconds between profiler reports; 0 disables them
    pub profile_report_interval: f32,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "rt_renderer.log".to_string(),
            show_fps: true,
            profile_report_interval: 5.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scene description
// ─────────────────────────────────────────────────────────────────────────────

/// Procedural meshes the demo knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Triangle,
    Quad,
    Cube,
}

impl ModelKind {
    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Triangle => "triangle",
            ModelKind::Quad => "quad",
            ModelKind::Cube => "cube",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MotionConfig {
    #[default]
    Static,
    Spin {
        degrees_per_second: f32,
    },
    MoveBackAndForth {
        distance: f32,
        speed: f32,
    },
    Resize {
        amount: f32,
        speed: f32,
    },
}

impl MotionConfig {
    pub fn to_motion(self) -> Motion {
        match self {
            MotionConfig::Static => Motion::Static,
            MotionConfig::Spin { degrees_per_second } => Motion::Spin {
                radians_per_second: degrees_per_second.to_radians(),
            },
            MotionConfig::MoveBackAndForth { distance, speed } => Motion::MoveBackAndForth { distance, speed },
            MotionConfig::Resize { amount, speed } => Motion::Resize { amount, speed },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectConfig {
    pub model: ModelKind,
    #[serde(default)]
    pub position: [f32; 3],
    /// Pitch, yaw, roll in degrees
    #[serde(default)]
    pub rotation: [f32; 3],
    #[serde(default = "unit_scale")]
    pub scale: [f32; 3],
    #[serde(default)]
    pub motion: MotionConfig,
}

fn unit_scale() -> [f32; 3] {
    [1.0; 3]
}

impl ObjectConfig {
    pub fn placement(&self) -> Placement {
        Placement {
            position: Vec3::from(self.position),
            rotation: Vec3::from(self.rotation.map(f32::to_radians)),
            scale: Vec3::from(self.scale),
        }
    }
}

/// `count` x `count` objects laid out on the XZ plane
#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    pub model: ModelKind,
    pub count: u32,
    #[serde(default = "default_spacing")]
    pub spacing: f32,
    #[serde(default)]
    pub motion: MotionConfig,
}

fn default_spacing() -> f32 {
    1.5
}

impl GridConfig {
    /// Grid centred on the origin.
    pub fn placements(&self) -> Vec<Placement> {
        let half = (self.count.saturating_sub(1)) as f32 * self.spacing * 0.5;
        (0..self.count)
            .flat_map(|row| (0..self.count).map(move |col| (row, col)))
            .map(|(row, col)| {
                Placement::at(Vec3::new(
                    col as f32 * self.spacing - half,
                    0.0,
                    row as f32 * self.spacing - half,
                ))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub camera_position: [f32; 3],
    pub camera_target: [f32; 3],
    pub field_of_view: f32,
    pub objects: Vec<ObjectConfig>,
    pub grid: Option<GridConfig>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            camera_position: [0.0, 3.0, -6.0],
            camera_target: [0.0, 0.0, 0.0],
            field_of_view: 60.0,
            objects: vec![
                ObjectConfig {
                    model: ModelKind::Quad,
                    position: [0.0, -0.5, 0.0],
                    rotation: [-90.0, 0.0, 0.0],
                    scale: [8.0, 8.0, 1.0],
                    motion: MotionConfig::Static,
                },
                ObjectConfig {
                    model: ModelKind::Cube,
                    position: [0.0, 0.5, 0.0],
                    rotation: [0.0; 3],
                    scale: [1.0; 3],
                    motion: MotionConfig::Spin {
                        degrees_per_second: 45.0,
                    },
                },
                ObjectConfig {
                    model: ModelKind::Triangle,
                    position: [-2.0, 0.5, 0.0],
                    rotation: [0.0; 3],
                    scale: [1.0; 3],
                    motion: MotionConfig::MoveBackAndForth { distance: 1.0, speed: 1.0 },
                },
            ],
            grid: None,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(2..=4).contains(&self.graphics.frame_count) {
            anyhow::bail!(
                "graphics.frame_count must be between 2 and 4, got {}",
                self.graphics.frame_count
            );
        }
        if self.descriptors.transient_capacity_per_frame == 0 {
            anyhow::bail!("descriptors.transient_capacity_per_frame must be non-zero");
        }
        self.build_preference()?;
        Ok(())
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn build_preference(&self) -> Result<BuildPreference> {
        match self.raytracing.preference.to_lowercase().as_str() {
            "fast_trace" => Ok(BuildPreference::FastTrace),
            "fast_build" => Ok(BuildPreference::FastBuild),
            other => anyhow::bail!("Unknown acceleration structure preference '{}'", other),
        }
    }

    pub fn acceleration_options(&self) -> Result<AccelerationOptions> {
        Ok(AccelerationOptions {
            preference: self.build_preference()?,
            allow_update: self.raytracing.allow_update,
            instance_mask: self.raytracing.instance_mask,
        })
    }

    pub fn renderer_desc(&self) -> RendererDesc {
        RendererDesc {
            clear_color: self.graphics.clear_color,
            persistent_descriptors: self.descriptors.persistent_capacity,
            transient_descriptors_per_frame: self.descriptors.transient_capacity_per_frame,
        }
    }

    /// Every configured object, grid included, in declaration order.
    pub fn scene_objects(&self) -> Vec<(ModelKind, Placement, Motion)> {
        let mut objects: Vec<_> = self
            .scene
            .objects
            .iter()
            .map(|o| (o.model, o.placement(), o.motion.to_motion()))
            .collect();
        if let Some(grid) = &self.scene.grid {
            let motion = grid.motion.to_motion();
            objects.extend(grid.placements().into_iter().map(|p| (grid.model, p, motion)));
        }
        objects
    }
}
