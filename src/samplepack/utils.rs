// Purpose: Utility functions for the project.

use std::path::{Path, PathBuf};

use anyhow::Result;
use pathdiff::diff_paths;
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use super::token::{SampleToken, SCRIPT_EXTENSION};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// Package specifiers of a requirements-style manifest. Blank lines and comments are skipped,
// everything else is passed through untouched.
pub fn manifest_entries(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .map(|line| match line.find(" #") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn ignore_dir(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s == "__pycache__")
        .unwrap_or(false)
}

/// Every file below `dir`, relative to it, in a stable order. Symlinks are followed and
/// listed under their own name.
pub fn list_tree(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = diff_paths(entry.path(), dir).ok_or_else(|| {
                anyhow::anyhow!("Could not relativise {:?} to {:?}", entry.path(), dir)
            })?;
            files.push(relative);
        }
    }
    Ok(files)
}

/// Sample tokens for the python scripts directly inside `script_dir`.
pub fn list_samples(script_dir: &Path) -> Result<Vec<SampleToken>> {
    let mut samples = vec![];
    for entry in WalkDir::new(script_dir)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(is_hidden(e) || ignore_dir(e)))
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION) {
            continue;
        }
        // Files whose names cannot be tokens cannot be selected either.
        if let Some(token) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| SampleToken::parse(n).ok())
        {
            samples.push(token);
        }
    }
    Ok(samples)
}
