// crates/reelkit-media/src/lib.rs

pub mod audio;
pub mod future;
pub mod image;
pub mod plugin;
pub mod ppm;
pub mod reader;
pub mod sequence;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use audio::{Audio, AudioInfo};
pub use future::{pair, Pending, Promise};
pub use image::{Image, ImageInfo, PixelType};
pub use plugin::{IoOptions, Plugin, PluginRegistry};
pub use reader::{AudioBlock, Info, Reader, VideoFrame, Writer};
