//! Binary-cache metadata records.
//!
//! `NarInfo` and `CacheInfo` are the two text documents a Nix binary cache
//! serves (`/{hash}.narinfo` and `/nix-cache-info`). Both are line-oriented
//! `Key: value` files. Serialization emits exactly the lines upstream caches
//! emit, in the same order, so a record relayed through any number of stores
//! reaches the client unchanged apart from its URL.

use std::fmt;
use std::str::FromStr;

// ── Compression ──────────────────────────────────────────────────────────────

/// Compression applied to the NAR behind a record's URL.
///
/// NARs are always streamed uncompressed. A record that declares anything
/// else is normalized to `None` when parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── NarInfo ──────────────────────────────────────────────────────────────────

/// Metadata for one store path, as served at `/{hash}.narinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarInfo {
    /// Absolute store path, e.g. `/nix/store/abc123-hello-2.12`.
    pub store_path: String,
    /// Relative URL the NAR can be fetched from. Rewritten by every store
    /// layer the record passes through.
    pub url: String,
    pub compression: Compression,
    /// Opaque hash string, e.g. `sha256:1b8m03r6...`.
    pub nar_hash: String,
    pub nar_size: u64,
    /// Store paths this path refers to, in declaration order.
    pub references: Vec<String>,
    pub deriver: Option<String>,
    /// Opaque signature strings, in declaration order.
    pub signatures: Vec<String>,
}

impl NarInfo {
    /// Return the same record with a different URL.
    pub fn with_url(self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self
        }
    }

    /// Parse the text form of a narinfo document.
    ///
    /// Unknown keys and blank lines are ignored. `StorePath`, `URL`,
    /// `NarHash` and `NarSize` are required; `Compression` defaults to
    /// `none` and any other declared value is normalized to `none`.
    pub fn parse(text: &str) -> Result<Self, RecordError> {
        let mut store_path = None;
        let mut url = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = Vec::new();
        let mut deriver = None;
        let mut signatures = Vec::new();

        for (key, value) in fields(text) {
            let (key, value) = (key?, value);
            match key {
                "StorePath" => store_path = Some(value.to_string()),
                "URL" => url = Some(value.to_string()),
                "NarHash" => nar_hash = Some(value.to_string()),
                "NarSize" => nar_size = Some(parse_int::<u64>("NarSize", value)?),
                "References" => {
                    references = value.split_whitespace().map(str::to_string).collect();
                }
                "Deriver" if !value.is_empty() => deriver = Some(value.to_string()),
                "Sig" => signatures.push(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            store_path: store_path.ok_or(RecordError::MissingField("StorePath"))?,
            url: url.ok_or(RecordError::MissingField("URL"))?,
            compression: Compression::None,
            nar_hash: nar_hash.ok_or(RecordError::MissingField("NarHash"))?,
            nar_size: nar_size.ok_or(RecordError::MissingField("NarSize"))?,
            references,
            deriver,
            signatures,
        })
    }
}

impl FromStr for NarInfo {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NarInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StorePath: {}", self.store_path)?;
        writeln!(f, "URL: {}", self.url)?;
        writeln!(f, "Compression: {}", self.compression)?;
        writeln!(f, "NarHash: {}", self.nar_hash)?;
        writeln!(f, "NarSize: {}", self.nar_size)?;
        if !self.references.is_empty() {
            writeln!(f, "References: {}", self.references.join(" "))?;
        }
        if let Some(deriver) = &self.deriver {
            writeln!(f, "Deriver: {}", deriver)?;
        }
        for sig in &self.signatures {
            writeln!(f, "Sig: {}", sig)?;
        }
        Ok(())
    }
}

// ── CacheInfo ────────────────────────────────────────────────────────────────

/// Cache-level metadata, as served at `/nix-cache-info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub store_dir: String,
    /// 1 = yes, 0 = no, -1 = the backing cache did not say.
    pub want_mass_query: i32,
    /// Lower values are preferred by clients.
    pub priority: i32,
}

/// Priority assumed when a cache does not declare one.
pub const DEFAULT_PRIORITY: i32 = 50;

impl CacheInfo {
    /// Best-effort record used when the backing cache cannot be asked.
    pub fn fallback(store_dir: impl Into<String>) -> Self {
        Self {
            store_dir: store_dir.into(),
            want_mass_query: -1,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    /// Parse the text form of a nix-cache-info document.
    /// Missing keys keep their fallback values.
    pub fn parse(text: &str) -> Result<Self, RecordError> {
        let mut info = Self::fallback("");
        for (key, value) in fields(text) {
            match key? {
                "StoreDir" => info.store_dir = value.to_string(),
                "WantMassQuery" => info.want_mass_query = parse_int("WantMassQuery", value)?,
                "Priority" => info.priority = parse_int("Priority", value)?,
                _ => {}
            }
        }
        Ok(info)
    }
}

impl FromStr for CacheInfo {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StoreDir: {}", self.store_dir)?;
        writeln!(f, "WantMassQuery: {}", self.want_mass_query)?;
        writeln!(f, "Priority: {}", self.priority)
    }
}

// ── Line parsing ─────────────────────────────────────────────────────────────

/// Split a document into trimmed `(key, value)` pairs, skipping blank lines.
/// A non-blank line without a colon yields an error in the key position.
fn fields(text: &str) -> impl Iterator<Item = (Result<&str, RecordError>, &str)> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| match line.split_once(':') {
            Some((k, v)) => (Ok(k.trim()), v.trim()),
            None => (Err(RecordError::MalformedLine(n + 1)), ""),
        })
}

fn parse_int<T: FromStr>(field: &'static str, value: &str) -> Result<T, RecordError> {
    value.parse().map_err(|_| RecordError::InvalidInteger {
        field,
        value: value.to_string(),
    })
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid integer for {field}: {value:?}")]
    InvalidInteger { field: &'static str, value: String },

    #[error("line {0} is not a `Key: value` pair")]
    MalformedLine(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
