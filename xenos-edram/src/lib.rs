pub mod config;
pub mod edram;
pub mod registers;
pub mod shaders;
pub mod vulkan;
pub mod xenos;

pub use config::{
    ConfigError, DepthFloat24Conversion, RenderTargetCacheConfig, RenderTargetPathConfig,
};
pub use edram::RenderTargetKey;
pub use vulkan::cache::{RenderTargetCache, RenderTargetPath};
