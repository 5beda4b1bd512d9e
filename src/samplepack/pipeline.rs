// The recipe is planned in three stages: assemble -> install -> bind.
// Each stage only consumes the previous stage's output, nothing here touches the network.

use std::path::PathBuf;

use log::debug;
use serde::Serialize;

use super::config::RecipeConfig;
use super::context::BuildContext;
use super::error::{BuildError, BuildResult};
use super::layers::{exec_form, EntryDescriptor, Layer, LayerSequence};
use super::token::SampleToken;
use super::utils;

/// A file or directory to be copied from the build context into the image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedItem {
    /// Absolute path in the caller's build context.
    pub source: PathBuf,
    /// Path inside the staged docker context, relative.
    pub staged: String,
    /// Absolute path inside the image.
    pub dest: String,
}

impl StagedItem {
    fn new(source: PathBuf, dest: &str) -> Self {
        Self {
            source,
            staged: dest.trim_start_matches('/').to_string(),
            dest: dest.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedTree {
    pub token: SampleToken,
    pub base_image: String,
    pub manifest: StagedItem,
    pub manifest_bytes: Vec<u8>,
    pub manifest_digest: String,
    pub packages: Vec<String>,
    pub library: StagedItem,
    pub library_files: Vec<PathBuf>,
    pub script: StagedItem,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallStep {
    pub command: Vec<String>,
    pub cache_key: String,
}

#[derive(Debug, Clone)]
pub struct InstalledTree {
    pub staged: StagedTree,
    pub install: InstallStep,
    pub layers: LayerSequence,
}

/// A fully planned image: the checked layer sequence plus what produced it.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub staged: StagedTree,
    pub install: InstallStep,
    pub layers: LayerSequence,
    pub entry: EntryDescriptor,
}

/// Resolves the token against the build context. The script is checked first so a
/// missing sample never gets as far as dependency installation.
pub fn assemble(
    ctx: &BuildContext,
    token: &SampleToken,
    config: &RecipeConfig,
) -> BuildResult<StagedTree> {
    config.validate()?;

    let script_path = ctx.script_path(config, token);
    if !script_path.is_file() {
        return Err(BuildError::MissingScript {
            token: token.to_string(),
            path: script_path,
        });
    }

    let manifest_path = ctx.manifest_path(config);
    if !manifest_path.is_file() {
        return Err(BuildError::MissingManifest {
            path: manifest_path,
        });
    }

    let library_path = ctx.library_path(config);
    if !library_path.is_dir() {
        return Err(BuildError::MissingLibrary { path: library_path });
    }

    let manifest_bytes = std::fs::read(&manifest_path)?;
    let manifest_digest = utils::sha256_hex(&manifest_bytes);
    let packages = utils::manifest_entries(&String::from_utf8_lossy(&manifest_bytes));
    let library_files = utils::list_tree(&library_path).map_err(|e| {
        BuildError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;

    debug!(
        "Assembled sample '{}': {} packages, {} library files",
        token,
        packages.len(),
        library_files.len()
    );

    Ok(StagedTree {
        token: token.clone(),
        base_image: config.base_image.clone(),
        manifest: StagedItem::new(manifest_path, &config.manifest_dest),
        manifest_bytes,
        manifest_digest,
        packages,
        library: StagedItem::new(library_path, &config.library_dest),
        library_files,
        script: StagedItem::new(script_path, &config.script_dest(&token.script_file_name())),
    })
}

// The install step sees the base image and the manifest, never the script or library.
pub fn install(staged: StagedTree, config: &RecipeConfig) -> BuildResult<InstalledTree> {
    let mut command = config.install_command.clone();
    command.push(staged.manifest.dest.clone());

    let cache_key = install_cache_key(&staged.base_image, &command, &staged.manifest_bytes);

    let mut layers = LayerSequence::new();
    layers.push(Layer::Base {
        image: staged.base_image.clone(),
    })?;
    layers.push(Layer::CopyManifest {
        src: staged.manifest.staged.clone(),
        dest: staged.manifest.dest.clone(),
    })?;
    layers.push(Layer::InstallDependencies {
        exec: exec_form(&command),
        command: command.clone(),
        cache_key: cache_key.clone(),
    })?;

    debug!("Install step for '{}' keyed {}", staged.token, cache_key);

    Ok(InstalledTree {
        staged,
        install: InstallStep { command, cache_key },
        layers,
    })
}

pub fn bind(installed: InstalledTree, config: &RecipeConfig) -> BuildResult<Recipe> {
    let InstalledTree {
        staged,
        install,
        mut layers,
    } = installed;

    let entry = EntryDescriptor {
        interpreter: config.interpreter.clone(),
        flags: config.interpreter_flags.clone(),
        script_path: staged.script.dest.clone(),
    };

    layers.push(Layer::CopyLibrary {
        src: staged.library.staged.clone(),
        dest: staged.library.dest.clone(),
    })?;
    layers.push(Layer::CopyScript {
        src: staged.script.staged.clone(),
        dest: staged.script.dest.clone(),
    })?;
    layers.push(Layer::Entry {
        exec: entry.exec_form(),
        entry: entry.clone(),
    })?;

    if !layers.is_complete()
        || layers
            .install_inputs()
            .iter()
            .any(|l| matches!(l, Layer::CopyScript { .. }))
    {
        return Err(BuildError::LayerOrder {
            reason: "dependency installation must not depend on the script".to_string(),
        });
    }

    debug!("Bound entry for '{}': {}", staged.token, entry);

    Ok(Recipe {
        staged,
        install,
        layers,
        entry,
    })
}

pub fn plan(ctx: &BuildContext, token: &SampleToken, config: &RecipeConfig) -> BuildResult<Recipe> {
    let staged = assemble(ctx, token, config)?;
    let installed = install(staged, config)?;
    bind(installed, config)
}

fn install_cache_key(base_image: &str, command: &[String], manifest: &[u8]) -> String {
    let mut material = Vec::with_capacity(manifest.len() + 128);
    material.extend_from_slice(base_image.as_bytes());
    material.push(0);
    for part in command {
        material.extend_from_slice(part.as_bytes());
        material.push(0);
    }
    material.extend_from_slice(manifest);
    utils::sha256_hex(&material)
}
