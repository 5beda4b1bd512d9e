use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{BuildError, BuildResult};

/// The command a container runs on start: `<interpreter> <flags...> <script>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub interpreter: String,
    pub flags: Vec<String>,
    pub script_path: String,
}

impl EntryDescriptor {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.interpreter.clone()];
        argv.extend(self.flags.iter().cloned());
        argv.push(self.script_path.clone());
        argv
    }

    /// JSON array form, so the runtime execs the interpreter directly instead of `sh -c`.
    pub fn exec_form(&self) -> String {
        exec_form(&self.argv())
    }
}

impl fmt::Display for EntryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

pub fn exec_form(argv: &[String]) -> String {
    // Serializing a Vec<String> cannot fail.
    serde_json::to_string(argv).unwrap_or_else(|_| "[]".to_string())
}

// One filesystem-mutating step of the image, in the order the image is assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Layer {
    Base { image: String },
    CopyManifest { src: String, dest: String },
    InstallDependencies { command: Vec<String>, exec: String, cache_key: String },
    CopyLibrary { src: String, dest: String },
    CopyScript { src: String, dest: String },
    Entry { entry: EntryDescriptor, exec: String },
}

impl Layer {
    pub fn rank(&self) -> u8 {
        match self {
            Layer::Base { .. } => 0,
            Layer::CopyManifest { .. } => 1,
            Layer::InstallDependencies { .. } => 2,
            Layer::CopyLibrary { .. } => 3,
            Layer::CopyScript { .. } => 4,
            Layer::Entry { .. } => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Layer::Base { .. } => "Base",
            Layer::CopyManifest { .. } => "CopyManifest",
            Layer::InstallDependencies { .. } => "InstallDependencies",
            Layer::CopyLibrary { .. } => "CopyLibrary",
            Layer::CopyScript { .. } => "CopyScript",
            Layer::Entry { .. } => "Entry",
        }
    }
}

/// Layers ordered from rarely changing to frequently changing. Every push is checked,
/// so a sequence that exists is always correctly ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LayerSequence {
    layers: Vec<Layer>,
}

impl LayerSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: Layer) -> BuildResult<()> {
        let expected = self.layers.len() as u8;
        if layer.rank() != expected {
            let after = self
                .layers
                .last()
                .map(|l| l.name())
                .unwrap_or("nothing");
            return Err(BuildError::LayerOrder {
                reason: format!("{} cannot follow {}", layer.name(), after),
            });
        }
        self.layers.push(layer);
        Ok(())
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.layers.last(), Some(Layer::Entry { .. }))
    }

    /// Layers whose content the dependency install step depends on, itself included.
    pub fn install_inputs(&self) -> &[Layer] {
        match self
            .layers
            .iter()
            .position(|l| matches!(l, Layer::InstallDependencies { .. }))
        {
            Some(idx) => &self.layers[..=idx],
            None => &[],
        }
    }

    pub fn entry(&self) -> Option<&EntryDescriptor> {
        self.layers.iter().find_map(|l| match l {
            Layer::Entry { entry, .. } => Some(entry),
            _ => None,
        })
    }
}
