use std::path::{Path, PathBuf};

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::docker;
use super::pipeline::Recipe;
use super::utils;

pub const STAGING_DIR: &str = "staging";
pub const CONTEXT_DIR: &str = "context";
pub const RECORD_FILE: &str = "build.json";

/// Default staging root, `~/.samplepack/staging`.
pub fn default_staging_root() -> Result<PathBuf> {
    let home = home::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".samplepack").join(STAGING_DIR))
}

// BuildRecord describes a staged build. It is kept outside the docker context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub token: String,
    pub image: String,
    pub manifest_digest: String,
    pub install_cache_key: String,
    pub entry: Vec<String>,
    pub generated_at: i64,
}

impl BuildRecord {
    pub fn load(sample_dir: &Path) -> Result<Self> {
        let record_file = sample_dir.join(RECORD_FILE);
        let record_json = std::fs::read_to_string(record_file)?;
        let record: BuildRecord = serde_json::from_str(&record_json)?;
        Ok(record)
    }

    pub fn save(&self, sample_dir: &Path) -> Result<()> {
        let record_file = sample_dir.join(RECORD_FILE);
        let record_json = serde_json::to_string_pretty(&self)?;
        std::fs::write(record_file, record_json)?;
        Ok(())
    }
}

/// A docker build context on disk, ready for `docker build`.
#[derive(Debug, Clone)]
pub struct StagedBuild {
    pub sample_dir: PathBuf,
    pub context_dir: PathBuf,
    pub dockerfile: PathBuf,
    pub record: BuildRecord,
}

#[cfg(test)]
impl StagedBuild {
    pub fn for_tests(sample_dir: PathBuf) -> Self {
        let context_dir = sample_dir.join(CONTEXT_DIR);
        Self {
            dockerfile: context_dir.join("Dockerfile"),
            context_dir,
            sample_dir,
            record: BuildRecord {
                token: "weather".to_string(),
                image: "c8y-sample-weather:latest".to_string(),
                manifest_digest: String::new(),
                install_cache_key: String::new(),
                entry: vec![],
                generated_at: 0,
            },
        }
    }
}

pub struct Generator {
    pub recipe: Recipe,
    pub image: String,
}

impl Generator {
    pub fn new(recipe: Recipe, image: String) -> Self {
        Self { recipe, image }
    }

    // Starts from an empty context every time so nothing from an earlier sample leaks in.
    pub fn generate_context_dir(&self, sample_dir: &Path) -> Result<PathBuf> {
        let context_dir = sample_dir.join(CONTEXT_DIR);
        if context_dir.exists() {
            std::fs::remove_dir_all(&context_dir)?;
        }
        std::fs::create_dir_all(&context_dir)?;
        Ok(context_dir)
    }

    pub fn stage_files(&self, context_dir: &Path) -> Result<()> {
        let staged = &self.recipe.staged;

        let manifest = context_dir.join(&staged.manifest.staged);
        create_parent(&manifest)?;
        std::fs::write(&manifest, &staged.manifest_bytes)?;

        let library = context_dir.join(&staged.library.staged);
        for relative in &staged.library_files {
            let target = library.join(relative);
            create_parent(&target)?;
            std::fs::copy(staged.library.source.join(relative), &target)?;
        }

        let script = context_dir.join(&staged.script.staged);
        create_parent(&script)?;
        std::fs::copy(&staged.script.source, &script)?;

        debug!(
            "Staged {} library files for '{}' into {}",
            staged.library_files.len(),
            staged.token,
            context_dir.display()
        );
        Ok(())
    }

    pub fn generate_docker(&self, context_dir: &Path) -> Result<PathBuf> {
        let dockerfile = docker::generate_dockerfile(&self.recipe)?;
        let dockerignore = docker::generate_docker_ignore()?;
        let dockerfile_path = context_dir.join("Dockerfile");
        std::fs::write(&dockerfile_path, dockerfile)?;
        std::fs::write(context_dir.join(".dockerignore"), dockerignore)?;
        Ok(dockerfile_path)
    }

    pub fn record(&self) -> BuildRecord {
        BuildRecord {
            token: self.recipe.staged.token.to_string(),
            image: self.image.clone(),
            manifest_digest: self.recipe.staged.manifest_digest.clone(),
            install_cache_key: self.recipe.install.cache_key.clone(),
            entry: self.recipe.entry.argv(),
            generated_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub fn generate(&self, staging_root: &Path) -> Result<StagedBuild> {
        let sample_dir = staging_root.join(self.recipe.staged.token.as_str());
        let context_dir = self.generate_context_dir(&sample_dir)?;
        self.stage_files(&context_dir)?;
        let dockerfile = self.generate_docker(&context_dir)?;

        let record = self.record();
        record.save(&sample_dir)?;

        Ok(StagedBuild {
            sample_dir,
            context_dir,
            dockerfile,
            record,
        })
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Relative paths of everything staged, for display and tests.
pub fn staged_files(build: &StagedBuild) -> Result<Vec<PathBuf>> {
    utils::list_tree(&build.context_dir)
}
