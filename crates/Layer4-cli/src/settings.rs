//! Settings file loading

use anyhow::Context;
use caravel_foundation::Settings;
use std::path::{Path, PathBuf};

/// Default settings location: `~/.caravel/settings.json`
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".caravel")
        .join("settings.json")
}

/// Load, migrate and validate settings
///
/// A missing file at the default location yields the defaults; a missing
/// file that was asked for explicitly is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Settings> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = default_path();
            if !path.exists() {
                tracing::debug!(path = %path.display(), "No settings file; using defaults");
                return Ok(Settings::default());
            }
            path
        }
    };

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Settings::from_json_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_missing_file_is_error() {
        let result = load(Some(Path::new("/definitely/not/here/settings.json")));
        assert!(result.is_err());
    }

    #[test]
    fn test_default_path_under_home() {
        assert!(default_path().ends_with(".caravel/settings.json"));
    }
}
