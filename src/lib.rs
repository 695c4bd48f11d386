use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::debug;
use walkdir::WalkDir;

mod app;
pub mod cache;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod limiter;

pub use app::{list_shortcut, ListShortcut, WallpaperPickerApp};
pub use cache::{CacheEntry, CacheStats, PreviewCache, PreviewImage, PreviewKey};
pub use coordinator::{PreviewConfig, PreviewCoordinator, PreviewSink, PreviewState, PreviewUpdate};
pub use decoder::{fit_long_edge, Decoder, ImageDecoder};
pub use error::{PreviewError, Result, WallpaperPickerError};
pub use limiter::{DecodeLimiter, DecodePermit};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];
const ACTIVE_WALLPAPER_FILE: &str = ".active_wallpaper";
const BYTES_PER_MB: usize = 1024 * 1024;

#[derive(Parser, Clone, Debug)]
#[command(name = "wallpaper-picker")]
#[command(about = "Preview the images in a directory and set one as the desktop wallpaper")]
pub struct Args {
    #[arg(short, long, default_value_os_t = default_wallpaper_dir())]
    pub directory: PathBuf,

    #[arg(short, long, help = "Include images in subdirectories")]
    pub recursive: bool,

    #[arg(short, long, default_value = "swww img --transition-type outer")]
    pub command: String,

    #[arg(long, default_value = "swww clear-cache", help = "Run before the command; empty to skip")]
    pub pre_command: String,

    #[arg(short, long, help = "Where the chosen path is recorded [default: <cache dir>/.active_wallpaper]")]
    pub selected_image_file: Option<PathBuf>,

    #[arg(long, help = "Enable debug output")]
    pub debug: bool,

    #[arg(long, default_value = "200")]
    pub max_cache_mb: usize,

    #[arg(long, default_value = "3")]
    pub max_concurrent_decodes: usize,

    #[arg(long, default_value = "300")]
    pub sweep_interval_secs: u64,

    #[arg(long, default_value = "1800")]
    pub max_entry_age_secs: u64,

    #[arg(long, default_value = "1200")]
    pub target_long_edge: u32,

    #[arg(long, default_value = "30")]
    pub load_timeout_secs: u64,
}

impl Args {
    pub fn selected_image_path(&self) -> PathBuf {
        self.selected_image_file.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join(ACTIVE_WALLPAPER_FILE)
        })
    }

    pub fn pre_command(&self) -> Option<&str> {
        Some(self.pre_command.trim()).filter(|command| !command.is_empty())
    }
}

impl From<&Args> for PreviewConfig {
    fn from(args: &Args) -> Self {
        Self {
            max_cache_bytes: args.max_cache_mb.saturating_mul(BYTES_PER_MB),
            max_concurrent_decodes: args.max_concurrent_decodes,
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            max_entry_age: Duration::from_secs(args.max_entry_age_secs),
            target_long_edge: args.target_long_edge,
            load_timeout: Duration::from_secs(args.load_timeout_secs),
        }
    }
}

/// `$HOME/Pictures` when it exists, the current directory otherwise.
pub fn default_wallpaper_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("Pictures"))
        .filter(|pictures| pictures.is_dir())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WallpaperEntry {
    pub name: String,
    pub path: PathBuf,
    pub relative_path: String,
}

/// Lists image files under `directory`, sorted by file name.
pub fn scan_images(directory: &Path, recursive: bool) -> Result<Vec<WallpaperEntry>> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut wallpapers = Vec::new();

    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            // The directory itself is unreadable
            Err(e) if e.depth() == 0 => {
                return Err(WallpaperPickerError::DirectoryScan {
                    path: directory.to_path_buf(),
                    source: e,
                })
            }
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_image_file(entry.path()) {
            continue;
        }

        let relative_path = entry
            .path()
            .strip_prefix(directory)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| entry.path().to_string_lossy().into_owned());

        wallpapers.push(WallpaperEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().to_path_buf(),
            relative_path,
        });
    }

    debug!("Found {} images in {:?}", wallpapers.len(), directory);
    Ok(wallpapers)
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext_str| IMAGE_EXTENSIONS.iter().any(|&valid_ext| valid_ext.eq_ignore_ascii_case(ext_str)))
        .unwrap_or(false)
}

pub fn validate_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(WallpaperPickerError::CommandExecution("Empty command".to_owned()));
    }
    Ok(())
}

/// Moves a list cursor by `delta`, wrapping at both ends. With nothing
/// selected, moving down lands on the first entry and moving up on the last.
pub fn wrap_index(current: Option<usize>, delta: isize, count: usize) -> Option<usize> {
    if count == 0 {
        return None;
    }
    match current {
        Some(current) => Some((current as isize + delta).rem_euclid(count as isize) as usize),
        None if delta < 0 => Some(count - 1),
        None => Some(0),
    }
}

/// Runs `command` with the absolute path of the image appended. A
/// `pre_command` (such as `swww clear-cache`) runs first, without arguments.
pub fn set_background(pre_command: Option<&str>, command: &str, path: &Path) -> Result<()> {
    if let Some(pre_command) = pre_command {
        run_command(pre_command, None)?;
    }

    let abs_path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    run_command(command, Some(&abs_path))
}

fn run_command(command: &str, path: Option<&Path>) -> Result<()> {
    let command_parts: Vec<&str> = command.split_whitespace().collect();
    let Some((program, args)) = command_parts.split_first() else {
        return Err(WallpaperPickerError::CommandExecution("Empty command".to_owned()));
    };

    debug!("Running {} {:?}", command, path);
    let output = Command::new(program)
        .args(args)
        .args(path)
        .output()
        .map_err(|e| WallpaperPickerError::CommandExecution(format!("{}: {}", program, e)))?;

    if !output.status.success() {
        let error_msg = String::from_utf8_lossy(&output.stderr);
        return Err(WallpaperPickerError::CommandExecution(error_msg.into_owned()));
    }

    Ok(())
}

pub fn save_selected_image(selected_image_file: &Path, path: &Path) -> Result<()> {
    if let Some(parent) = selected_image_file.parent() {
        fs::create_dir_all(parent).map_err(WallpaperPickerError::SaveSelectedImage)?;
    }

    let abs_path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    fs::write(selected_image_file, abs_path.to_string_lossy().as_bytes())
        .map_err(WallpaperPickerError::SaveSelectedImage)?;

    Ok(())
}
