//! Platform directories for settings and model artifacts.
//!
//! | Platform | settings (`config_dir`)                   | artifacts (`models_dir`)                        |
//! |----------|-------------------------------------------|-------------------------------------------------|
//! | Windows  | `%APPDATA%\voice-sidecar\`                | `%LOCALAPPDATA%\voice-sidecar\models\`          |
//! | macOS    | `~/Library/Application Support/voice-sidecar/` | same root, `models/`                       |
//! | Linux    | `~/.config/voice-sidecar/`                | `~/.local/share/voice-sidecar/models/`          |

use std::path::{Path, PathBuf};

const APP_NAME: &str = "voice-sidecar";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    /// `<config_dir>/settings.toml`.
    pub settings_file: PathBuf,
    /// Activated artifacts plus their `.partial` staging dirs.
    pub models_dir: PathBuf,
}

impl AppPaths {
    /// Resolve via `dirs`, falling back to the working directory when the
    /// platform has no answer.
    pub fn new() -> Self {
        let config_root = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_root = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::under(&config_root, &data_root)
    }

    /// Lay the application directories out below explicit roots.
    pub fn under(config_root: &Path, data_root: &Path) -> Self {
        let config_dir = config_root.join(APP_NAME);
        Self {
            settings_file: config_dir.join(SETTINGS_FILE),
            config_dir,
            models_dir: data_root.join(APP_NAME).join("models"),
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
