//! Render target cache configuration

use crate::xenos::MAX_RESOLUTION_SCALE;
use std::str::FromStr;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown render target path '{0}', expected \"\", \"fbo\" or \"fsi\"")]
    UnknownRenderTargetPath(String),
}

/// Requested method of emulating EDRAM render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderTargetPathConfig {
    // Pick the most accurate path that the device supports
    #[default]
    Auto,
    // Host framebuffer attachments, with ownership transfers between them
    HostRenderTargets,
    // EDRAM buffer accessed directly from fragment shaders within an interlock
    PixelShaderInterlock,
}

impl FromStr for RenderTargetPathConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Auto),
            "fbo" => Ok(Self::HostRenderTargets),
            "fsi" => Ok(Self::PixelShaderInterlock),
            _ => Err(ConfigError::UnknownRenderTargetPath(s.into())),
        }
    }
}

/// How 20e4 depth is converted between host float32 depth and guest D24FS8 data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DepthFloat24Conversion {
    // Keep full host precision while drawing, truncate when copying to guest data
    #[default]
    OnCopy,
    // Truncate drawn depth to 20e4 precision
    Truncate,
    // Round drawn depth to the nearest 20e4 value
    Round,
}

impl DepthFloat24Conversion {
    pub fn rounds(self) -> bool {
        self == Self::Round
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RenderTargetCacheConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub render_target_path_vulkan: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub depth_float24_conversion: DepthFloat24Conversion,
    #[cfg_attr(feature = "serde", serde(default = "true_fn"))]
    pub depth_transfer_not_equal_test: bool,
    #[cfg_attr(feature = "serde", serde(default = "default_resolution_scale"))]
    pub draw_resolution_scale_x: u32,
    #[cfg_attr(feature = "serde", serde(default = "default_resolution_scale"))]
    pub draw_resolution_scale_y: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub gamma_render_target_as_srgb: bool,
    #[cfg_attr(feature = "serde", serde(default = "true_fn"))]
    pub mrt_edram_used_range_clamp_to_min: bool,
    #[cfg_attr(feature = "serde", serde(default = "true_fn"))]
    pub native_2x_msaa: bool,
    #[cfg_attr(feature = "serde", serde(default = "true_fn"))]
    pub native_stencil_value_output: bool,
    #[cfg_attr(feature = "serde", serde(default = "true_fn"))]
    pub snorm16_render_target_full_range: bool,
}

#[cfg(feature = "serde")]
fn true_fn() -> bool {
    true
}

#[cfg(feature = "serde")]
fn default_resolution_scale() -> u32 {
    1
}

impl Default for RenderTargetCacheConfig {
    fn default() -> Self {
        Self {
            render_target_path_vulkan: String::new(),
            depth_float24_conversion: DepthFloat24Conversion::default(),
            depth_transfer_not_equal_test: true,
            draw_resolution_scale_x: 1,
            draw_resolution_scale_y: 1,
            gamma_render_target_as_srgb: false,
            mrt_edram_used_range_clamp_to_min: true,
            native_2x_msaa: true,
            native_stencil_value_output: true,
            snorm16_render_target_full_range: true,
        }
    }
}

impl RenderTargetCacheConfig {
    pub fn render_target_path(&self) -> Result<RenderTargetPathConfig, ConfigError> {
        self.render_target_path_vulkan.parse()
    }

    /// Resolution scale clamped to what the EDRAM buffer addressing supports.
    pub fn resolution_scale(&self) -> (u32, u32) {
        let clamp = |scale: u32| {
            let clamped = scale.clamp(1, MAX_RESOLUTION_SCALE);
            if clamped != scale {
                log::warn!("Draw resolution scale {scale} clamped to {clamped}");
            }
            clamped
        };
        (clamp(self.draw_resolution_scale_x), clamp(self.draw_resolution_scale_y))
    }
}
