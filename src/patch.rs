//! Tag substitution inside base64-encoded file bodies.
//!
//! The transform is a single left-to-right pass: at each position the first tag
//! (in insertion order) that starts there is replaced, and scanning resumes after
//! the matched tag. Replacement values are never rescanned.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("tags must not be empty")]
    EmptyTag,

    #[error("unsupported content encoding {0:?}, expected base64")]
    UnsupportedEncoding(String),

    #[error("content is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("content is not UTF-8 text")]
    NotUtf8,
}

// -----------------------------------------------------------------------------
// ReplacementSet

/// Ordered tag → value pairs with unique tags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacementSet {
    pairs: Vec<(String, String)>,
}

impl ReplacementSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair. Re-inserting a tag replaces its value and keeps its position.
    pub fn insert(
        &mut self,
        tag: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), PatchError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(PatchError::EmptyTag);
        }
        let value = value.into();
        match self.pairs.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, existing)) => *existing = value,
            None => self.pairs.push((tag, value)),
        }
        Ok(())
    }

    /// Build from `TAG=value` strings as given on the command line
    pub fn parse_assignments<'a>(
        assignments: impl IntoIterator<Item = &'a str>,
    ) -> anyhow::Result<Self> {
        let mut set = Self::new();
        for assignment in assignments {
            let (tag, value) = assignment
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected TAG=value, got {:?}", assignment))?;
            set.insert(tag, value)?;
        }
        Ok(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(t, v)| (t.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl TryFrom<Vec<(String, String)>> for ReplacementSet {
    type Error = PatchError;

    fn try_from(pairs: Vec<(String, String)>) -> Result<Self, Self::Error> {
        let mut set = Self::new();
        for (tag, value) in pairs {
            set.insert(tag, value)?;
        }
        Ok(set)
    }
}

// -----------------------------------------------------------------------------
// Transform

/// Replace every occurrence of each tag with its value.
pub fn patch(raw: &str, replacements: &ReplacementSet) -> String {
    patch_counted(raw, replacements).0
}

/// Like [`patch`], also returning how often each tag matched (in set order)
pub fn patch_counted(raw: &str, replacements: &ReplacementSet) -> (String, Vec<usize>) {
    let mut counts = vec![0; replacements.len()];
    if replacements.is_empty() {
        return (raw.to_string(), counts);
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(ch) = rest.chars().next() {
        let hit = replacements
            .pairs
            .iter()
            .enumerate()
            .find(|(_, (tag, _))| rest.starts_with(tag.as_str()));
        match hit {
            Some((index, (tag, value))) => {
                out.push_str(value);
                counts[index] += 1;
                rest = &rest[tag.len()..];
            }
            None => {
                out.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }
    (out, counts)
}

// -----------------------------------------------------------------------------
// EncodedBody

/// A decoded file body that remembers how the host wrapped its base64.
///
/// Hosts commonly return base64 broken into fixed-width lines. Re-encoding with
/// the same layout keeps an unpatched body byte-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub text: String,
    line_width: Option<usize>,
    trailing_newline: bool,
}

impl EncodedBody {
    /// Decode a host `content` field with its `encoding` marker
    pub fn decode(encoded: &str, encoding: &str) -> Result<Self, PatchError> {
        if !encoding.is_empty() && encoding != "base64" {
            return Err(PatchError::UnsupportedEncoding(encoding.to_string()));
        }

        let trailing_newline = encoded.ends_with('\n');
        // A single line says nothing about the host's wrap width
        let mut lines = encoded.lines();
        let line_width = match (lines.next(), lines.next()) {
            (Some(first), Some(_)) => Some(first.len()),
            _ => None,
        };

        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| PatchError::InvalidBase64(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|_| PatchError::NotUtf8)?;

        Ok(Self {
            text,
            line_width,
            trailing_newline,
        })
    }

    /// Encode `text` using this body's line layout
    pub fn encode(&self, text: &str) -> String {
        let compact = STANDARD.encode(text.as_bytes());
        let mut out = match self.line_width {
            Some(width) if width > 0 => {
                let mut wrapped = String::with_capacity(compact.len() + compact.len() / width);
                for (i, chunk) in compact.as_bytes().chunks(width).enumerate() {
                    if i > 0 {
                        wrapped.push('\n');
                    }
                    // base64 output is ASCII, so byte chunks are valid str
                    wrapped.push_str(&String::from_utf8_lossy(chunk));
                }
                wrapped
            }
            _ => compact,
        };
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }
}
