// crates/reelkit-media/src/plugin.rs
//
// Reader plugins and the registry that dispatches paths to them.
// The registry is immutable after construction; selection is by
// lower-cased extension, first registered plugin wins.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use reelkit_core::{IoError, SeqPath};

use crate::reader::{Info, Reader, Writer};

// ── Capability categories ─────────────────────────────────────────────────────
//
// A plugin advertises exactly one; `get_extensions` masks combine them.

pub const VIDEO_ONLY: u8 = 1 << 0;
pub const AUDIO_ONLY: u8 = 1 << 1;
pub const VIDEO_AND_AUDIO: u8 = 1 << 2;
pub const ANY_CAPABILITY: u8 = VIDEO_ONLY | AUDIO_ONLY | VIDEO_AND_AUDIO;

// ── Options ───────────────────────────────────────────────────────────────────

/// Free-form string options handed to plugins at open time, e.g.
/// `"SequenceIO/DefaultSpeed" -> "24"`.
pub type IoOptions = HashMap<String, String>;

pub fn opt_usize(options: &IoOptions, key: &str, default: usize) -> usize {
    options
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn opt_f64(options: &IoOptions, key: &str, default: f64) -> f64 {
    options
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn opt_millis(options: &IoOptions, key: &str, default: Duration) -> Duration {
    options
        .get(key)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// ── Plugin contract ───────────────────────────────────────────────────────────

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Lower-case extensions, no leading dot.
    fn extensions(&self) -> &[&str];

    /// One of the capability category bits.
    fn capabilities(&self) -> u8;

    fn read(&self, path: &SeqPath, options: &IoOptions) -> Result<Box<dyn Reader>, IoError>;

    fn write(
        &self,
        path: &SeqPath,
        _info: &Info,
        _options: &IoOptions,
    ) -> Result<Box<dyn Writer>, IoError> {
        Err(IoError::OpenFailed {
            path:   path.full(),
            reason: format!("{} does not support writing", self.name()),
        })
    }

    /// Concrete-type escape hatch for `get_plugin_by_type`.
    fn as_any(&self) -> &dyn Any;
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Registry with the built-in plugins: image sequences always, FFmpeg
    /// when the `ffmpeg` feature is enabled.
    pub fn new() -> PluginRegistry {
        PluginRegistry::with_plugins(Vec::new())
    }

    /// Registry with `extra` plugins registered ahead of the built-ins, so
    /// they win extension ties.
    pub fn with_plugins(extra: Vec<Arc<dyn Plugin>>) -> PluginRegistry {
        let mut plugins = extra;
        plugins.push(Arc::new(crate::sequence::SequencePlugin));
        #[cfg(feature = "ffmpeg")]
        plugins.push(Arc::new(crate::ffmpeg::FFmpegPlugin));
        PluginRegistry { plugins }
    }

    pub fn get_plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Plugin for a path, by extension. An empty extension matches nothing.
    pub fn get_plugin(&self, path: &SeqPath) -> Option<Arc<dyn Plugin>> {
        let extension = path.extension();
        if extension.is_empty() {
            return None;
        }
        self.plugins
            .iter()
            .find(|p| p.extensions().contains(&extension.as_str()))
            .cloned()
    }

    pub fn get_plugin_by_type<T: Plugin + 'static>(&self) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|p| p.as_any().is::<T>())
            .cloned()
    }

    pub fn read(&self, path: &SeqPath, options: &IoOptions) -> Result<Box<dyn Reader>, IoError> {
        let plugin = self
            .get_plugin(path)
            .ok_or_else(|| IoError::NotFound { path: path.full() })?;
        plugin.read(path, options)
    }

    pub fn write(
        &self,
        path: &SeqPath,
        info: &Info,
        options: &IoOptions,
    ) -> Result<Box<dyn Writer>, IoError> {
        let plugin = self
            .get_plugin(path)
            .ok_or_else(|| IoError::NotFound { path: path.full() })?;
        plugin.write(path, info, options)
    }

    /// All extensions whose plugin capability intersects `mask`.
    pub fn get_extensions(&self, mask: u8) -> BTreeSet<String> {
        self.plugins
            .iter()
            .filter(|p| p.capabilities() & mask != 0)
            .flat_map(|p| p.extensions().iter().map(|e| e.to_string()))
            .collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
