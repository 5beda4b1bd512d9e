use std::path::{Path, PathBuf};

use anyhow::Result;

use super::config::RecipeConfig;
use super::token::SampleToken;
use super::utils;

/// The caller's directory holding manifest, scripts and library. Read only.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
}

impl BuildContext {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self, config: &RecipeConfig) -> PathBuf {
        self.root.join(&config.manifest)
    }

    pub fn library_path(&self, config: &RecipeConfig) -> PathBuf {
        self.root.join(&config.library)
    }

    pub fn script_dir(&self, config: &RecipeConfig) -> PathBuf {
        self.root.join(&config.script_dir)
    }

    pub fn script_path(&self, config: &RecipeConfig, token: &SampleToken) -> PathBuf {
        self.script_dir(config).join(token.script_file_name())
    }

    pub fn samples(&self, config: &RecipeConfig) -> Result<Vec<SampleToken>> {
        utils::list_samples(&self.script_dir(config))
    }
}
