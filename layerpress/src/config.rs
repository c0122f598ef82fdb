use std::env;
use std::path::PathBuf;
use std::thread;

const DEFAULT_LAYERPRESS_DIR: &str = "~/.layerpress";
const DEFAULT_CONCURRENT_UPLOADS: usize = 4;

pub fn get_layerpress_dir() -> PathBuf {
    let layerpress_dir =
        env::var("LAYERPRESS_DIR").unwrap_or(DEFAULT_LAYERPRESS_DIR.to_string());
    if let Some(rest) = layerpress_dir.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    }

    layerpress_dir.into()
}

pub fn get_concurrent_uploads() -> usize {
    env::var("CONCURRENT_UPLOADS")
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_CONCURRENT_UPLOADS)
}

/// Per-export compression workers, defaulting to the available parallelism.
pub fn get_compression_workers() -> usize {
    env::var("LAYERPRESS_WORKERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
}
