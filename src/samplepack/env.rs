// Environment handed to the container at run time. The image itself defines none of it.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;

use anyhow::{anyhow, Result};
use log::debug;

pub const C8Y_PREFIX: &str = "C8Y_";

/// `KEY=VALUE` is taken literally, a bare `KEY` is looked up in the host environment.
pub fn resolve_env_map(env_map: &[String]) -> Vec<(String, String)> {
    env_map
        .iter()
        .map(|x| {
            if let Some((key, value)) = x.split_once('=') {
                (key.to_string(), value.to_string())
            } else {
                let resolved = std::env::var(x).unwrap_or_default();
                (x.clone(), resolved)
            }
        })
        .collect()
}

/// Names and values of all `C8Y_*` variables in `vars`, sorted by name.
pub fn c8y_keys<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut keys: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(k, _)| k.starts_with(C8Y_PREFIX))
        .collect();
    keys.sort();
    keys
}

// Minimal dotenv reader: KEY=VALUE per line, `export ` prefix, comments and matching quotes.
pub fn parse_env_file(content: &str) -> Result<Vec<(String, String)>> {
    let mut vars = vec![];
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid line {} in env file: '{}'", idx + 1, line))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(anyhow!("Invalid variable name on line {}: '{}'", idx + 1, key));
        }
        vars.push((key.to_string(), unquote(value.trim()).to_string()));
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

pub fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read env file {}: {}", path.display(), e))?;
    let vars = parse_env_file(&content)?;
    debug!("Read {} variables from {}", vars.len(), path.display());
    Ok(vars)
}

/// Later sources win: forwarded C8Y_* variables, then the env file, then explicit entries.
pub fn merge(sources: &[Vec<(String, String)>]) -> Vec<(String, String)> {
    let mut merged = BTreeMap::new();
    for source in sources {
        for (key, value) in source {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.into_iter().collect()
}

pub fn build_env_with_extras(extras: &[(String, String)]) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = std::env::vars_os().collect();
    for (key, value) in extras {
        // Remove existing entry if present, then add
        env.retain(|(k, _)| k != key.as_str());
        env.push((key.into(), value.into()));
    }
    env
}
