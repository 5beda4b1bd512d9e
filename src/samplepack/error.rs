use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Invalid sample token '{token}': {reason}")]
    InvalidToken { token: String, reason: String },

    #[error("Missing script: {} not found in build context", .path.display())]
    MissingScript { token: String, path: PathBuf },

    #[error("Missing manifest: {} not found in build context", .path.display())]
    MissingManifest { path: PathBuf },

    #[error("Missing library: directory {} not found in build context", .path.display())]
    MissingLibrary { path: PathBuf },

    #[error("Layer ordering violated: {reason}")]
    LayerOrder { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Invalid image tag '{tag}'")]
    InvalidTag { tag: String },

    #[error("Docker or Podman not found.")]
    ExecutorNotFound,

    #[error("Dependency resolution failed for manifest {manifest} ({status})")]
    DependencyResolution { manifest: String, status: String },

    #[error("Failed to build image {image} ({status})")]
    ImageBuild { image: String, status: String },

    #[error("Container execution timed out after {timeout_secs} seconds")]
    RunTimeout { timeout_secs: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BuildResult<T> = Result<T, BuildError>;
