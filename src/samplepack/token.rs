// The placeholder token naming one sample script.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{BuildError, BuildResult};
use super::utils;

pub const PLACEHOLDER: &str = "{SAMPLE}";
pub const SCRIPT_EXTENSION: &str = "py";

/// A validated sample name. It resolves to `<token>.py` in the build context and to
/// `/<token>.py` (under the configured script destination) inside the image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SampleToken(String);

impl SampleToken {
    pub fn parse(raw: &str) -> BuildResult<Self> {
        let trimmed = raw.trim();
        let stem = trimmed.strip_suffix(".py").unwrap_or(trimmed);

        let invalid = |reason: &str| BuildError::InvalidToken {
            token: raw.to_string(),
            reason: reason.to_string(),
        };

        if stem.is_empty() {
            return Err(invalid("token is empty"));
        }
        if stem.starts_with('.') || stem.starts_with('-') {
            return Err(invalid("token must not start with '.' or '-'"));
        }
        if stem.contains('/') || stem.contains('\\') {
            return Err(invalid("token must not contain path separators"));
        }
        if let Some(c) = stem
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(invalid(&format!("unsupported character '{}'", c)));
        }
        Ok(Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn script_file_name(&self) -> String {
        format!("{}.{}", self.0, SCRIPT_EXTENSION)
    }

    /// The token as one path component of an image reference. Tokens that already are a
    /// valid lowercase component are used as they are. Anything else is normalised and
    /// suffixed with a digest of the token, so `Weather` and `weather` never share an image.
    pub fn image_component(&self) -> String {
        if is_reference_component(&self.0) {
            return self.0.clone();
        }
        let digest = utils::sha256_hex(self.0.as_bytes());
        let mut normalised = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() {
                normalised.push(c.to_ascii_lowercase());
            } else if !normalised.is_empty() && !normalised.ends_with('-') {
                normalised.push('-');
            }
        }
        let normalised = normalised.trim_end_matches('-');
        if normalised.is_empty() {
            digest[..COMPONENT_DIGEST_LEN].to_string()
        } else {
            format!("{}-{}", normalised, &digest[..COMPONENT_DIGEST_LEN])
        }
    }

    /// Replaces every `{SAMPLE}` in an image name template with `image_component`.
    pub fn substitute_image(&self, template: &str) -> String {
        template.replace(PLACEHOLDER, &self.image_component())
    }
}

const COMPONENT_DIGEST_LEN: usize = 8;

// Docker's path component grammar: [a-z0-9]+ joined by '.', '_', '__' or any run of '-'.
fn is_reference_component(s: &str) -> bool {
    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    if !s.starts_with(is_alnum) || !s.ends_with(is_alnum) {
        return false;
    }
    s.split(is_alnum)
        .filter(|sep| !sep.is_empty())
        .all(|sep| matches!(sep, "." | "_" | "__") || sep.chars().all(|c| c == '-'))
}

impl fmt::Display for SampleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SampleToken {
    type Error = BuildError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SampleToken> for String {
    fn from(token: SampleToken) -> Self {
        token.0
    }
}
