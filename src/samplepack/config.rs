use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use super::error::{BuildError, BuildResult};
use super::token::PLACEHOLDER;

pub const CONFIG_FILE_NAME: &str = "samplepack.json";

// RecipeConfig holds everything the image recipe used to hard-code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub base_image: String,
    pub interpreter: String,
    pub interpreter_flags: Vec<String>,
    pub manifest: PathBuf,
    pub manifest_dest: String,
    pub library: PathBuf,
    pub library_dest: String,
    pub script_dir: PathBuf,
    pub script_dest_dir: String,
    pub install_command: Vec<String>,
    pub image_template: String,
    pub build_timeout_secs: u64,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            base_image: "python:3.11-slim".to_string(),
            interpreter: "python".to_string(),
            interpreter_flags: vec!["-u".to_string()],
            manifest: PathBuf::from("requirements.txt"),
            manifest_dest: "/requirements.txt".to_string(),
            library: PathBuf::from("c8y_api"),
            library_dest: "/c8y_api".to_string(),
            script_dir: PathBuf::from("."),
            script_dest_dir: "/".to_string(),
            install_command: vec![
                "pip".to_string(),
                "install".to_string(),
                "--no-cache-dir".to_string(),
                "-r".to_string(),
            ],
            image_template: "c8y-sample-{SAMPLE}".to_string(),
            build_timeout_secs: 900,
        }
    }
}

impl RecipeConfig {
    pub fn load(path: &Path) -> BuildResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: RecipeConfig =
            serde_json::from_str(&raw).map_err(|e| BuildError::InvalidConfig {
                reason: format!("{}: {}", path.display(), e),
            })?;
        debug!("Loaded recipe config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Explicit file first, then `samplepack.json` in the build context, then defaults.
    pub fn resolve(explicit: Option<&Path>, context_root: &Path) -> BuildResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let in_context = context_root.join(CONFIG_FILE_NAME);
        if in_context.is_file() {
            return Self::load(&in_context);
        }
        debug!("No {} found, using default recipe config", CONFIG_FILE_NAME);
        Ok(Self::default())
    }

    pub fn base_image(mut self, base_image: String) -> Self {
        self.base_image = base_image;
        self
    }

    pub fn interpreter(mut self, interpreter: String) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn validate(&self) -> BuildResult<()> {
        let invalid = |reason: String| Err(BuildError::InvalidConfig { reason });

        if self.base_image.trim().is_empty() {
            return invalid("base_image must not be empty".to_string());
        }
        if self.interpreter.trim().is_empty() {
            return invalid("interpreter must not be empty".to_string());
        }
        if self.install_command.first().map_or(true, |p| p.trim().is_empty()) {
            return invalid("install_command needs a program".to_string());
        }
        // The placeholder itself is uppercase, only the literal parts must be lowercase.
        // A ':' is a registry port before the last '/', and a tag after it.
        let literal = self.image_template.replace(PLACEHOLDER, "");
        let repository = literal.rsplit('/').next().unwrap_or_default();
        if !self.image_template.contains(PLACEHOLDER)
            || literal
                .chars()
                .any(|c| c.is_ascii_uppercase() || c.is_whitespace())
            || repository.contains(':')
        {
            return invalid(format!(
                "image_template '{}' must be a lowercase image name containing {}",
                self.image_template, PLACEHOLDER
            ));
        }
        for (field, dest) in [
            ("manifest_dest", &self.manifest_dest),
            ("library_dest", &self.library_dest),
            ("script_dest_dir", &self.script_dest_dir),
        ] {
            if !dest.starts_with('/') {
                return invalid(format!("{} must be an absolute path, got '{}'", field, dest));
            }
        }
        for (field, dest) in [
            ("manifest_dest", &self.manifest_dest),
            ("library_dest", &self.library_dest),
        ] {
            if dest.trim_end_matches('/').is_empty() {
                return invalid(format!("{} must not be the image root", field));
            }
        }
        for (field, src) in [("manifest", &self.manifest), ("library", &self.library)] {
            if src.as_os_str().is_empty() || src.is_absolute() {
                return invalid(format!(
                    "{} must be a path relative to the build context, got '{}'",
                    field,
                    src.display()
                ));
            }
        }
        if self.script_dir.is_absolute() {
            return invalid("script_dir must be relative to the build context".to_string());
        }
        Ok(())
    }

    /// In-image path of the script for the given file name, e.g. `/weather.py`.
    pub fn script_dest(&self, script_file_name: &str) -> String {
        format!("{}/{}", self.script_dest_dir.trim_end_matches('/'), script_file_name)
    }
}
