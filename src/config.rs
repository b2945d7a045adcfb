//! Configuration for segments and their page source.
//!
//! Only `max_size` is required. Page and table sizes default to heuristics
//! derived from it:
//!
//! ```toml
//! [segment]
//! max_size = "1MB"
//! # page_size = "16KB"
//! # table_size = 8192
//! # hugepage = "none"
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::engine::PagedEngine;
use crate::page_source::PageSource;
use crate::region::HugepageSize;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Smallest page the heuristics will pick.
pub const MIN_PAGE_SIZE: usize = 4 * KB;

/// Largest page the heuristics will pick.
pub const MAX_PAGE_SIZE: usize = 8 * MB;

pub const MIN_TABLE_SIZE: usize = 64;
pub const MAX_TABLE_SIZE: usize = 1 << 22;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Sizing of one segment and the page source behind it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentConfig {
    /// Total bytes mapped for the page source (e.g., "1MB").
    #[serde(deserialize_with = "deserialize_size")]
    pub max_size: usize,

    /// Page size. Derived from `max_size` when unset.
    #[serde(default, deserialize_with = "deserialize_opt_size")]
    pub page_size: Option<usize>,

    /// Number of slots in the entry table. Derived from `max_size` when unset.
    #[serde(default)]
    pub table_size: Option<usize>,

    #[serde(default)]
    pub hugepage: HugepageSize,
}

impl SegmentConfig {
    /// A config sized entirely by heuristics.
    pub fn for_size(max_size: usize) -> Self {
        Self {
            max_size,
            page_size: None,
            table_size: None,
            hugepage: HugepageSize::None,
        }
    }

    /// Configured page size, or max_size / 64 rounded down to a power of two
    /// and clamped to [`MIN_PAGE_SIZE`, `MAX_PAGE_SIZE`]. Never above
    /// `max_size`.
    pub fn page_size(&self) -> usize {
        self.page_size.unwrap_or_else(|| {
            let target = prev_power_of_two(self.max_size / 64);
            target
                .clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
                .min(prev_power_of_two(self.max_size))
        })
    }

    /// Configured table size, or max_size / 128 rounded up to a power of two
    /// and clamped to [`MIN_TABLE_SIZE`, `MAX_TABLE_SIZE`].
    pub fn table_size(&self) -> usize {
        self.table_size.unwrap_or_else(|| {
            (self.max_size / 128)
                .max(1)
                .next_power_of_two()
                .clamp(MIN_TABLE_SIZE, MAX_TABLE_SIZE)
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid("max_size must be non-zero".into()));
        }

        let page_size = self.page_size();
        if !page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page_size must be a power of two (got {page_size})"
            )));
        }
        if page_size > self.max_size {
            return Err(ConfigError::Invalid(format!(
                "page_size {page_size} exceeds max_size {}",
                self.max_size
            )));
        }

        let table_size = self.table_size();
        if !table_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "table_size must be a power of two (got {table_size})"
            )));
        }

        Ok(())
    }

    /// Validate and map the page source described by this config.
    pub fn page_source(&self) -> Result<Arc<PageSource>, ConfigError> {
        self.validate()?;
        let source = PageSource::new(self.max_size, self.page_size(), self.hugepage)?;
        Ok(Arc::new(source))
    }

    /// A fresh engine drawing pages from `source`.
    pub fn engine(&self, source: &Arc<PageSource>) -> PagedEngine {
        PagedEngine::new(source.clone(), self.table_size())
    }
}

fn prev_power_of_two(n: usize) -> usize {
    if n == 0 { 1 } else { 1 << n.ilog2() }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "offheap_segment=debug".
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "LoggingConfig::default_timestamps")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default)]
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            timestamps: Self::default_timestamps(),
            target: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_timestamps() -> bool {
        true
    }
}

/// Read and parse a TOML file.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

/// A size written either as a byte count or as a string with a unit.
#[derive(Deserialize)]
#[serde(untagged)]
enum Size {
    Bytes(u64),
    Text(String),
}

impl Size {
    fn resolve(self) -> Result<usize, String> {
        match self {
            Size::Bytes(n) => usize::try_from(n).map_err(|e| e.to_string()),
            Size::Text(s) => parse_size(&s),
        }
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Size::deserialize(deserializer)?
        .resolve()
        .map_err(serde::de::Error::custom)
}

fn deserialize_opt_size<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Size>::deserialize(deserializer)?
        .map(Size::resolve)
        .transpose()
        .map_err(serde::de::Error::custom)
}

/// Parse a size string like "1GB", "512MB", "4KB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());

    let (num_str, suffix) = s.split_at(num_end);
    let num: f64 = num_str
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", num_str, e))?;

    let multiplier: usize = match suffix.trim().to_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => KB,
        "MB" | "M" => MB,
        "GB" | "G" => 1024 * MB,
        other => return Err(format!("unknown size suffix '{}'", other)),
    };

    Ok((num * multiplier as f64) as usize)
}
