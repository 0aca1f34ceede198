use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

/// A volume to rotate onto, optionally capped at `capacity` bytes.
///
/// Parsed from `PATH` or `PATH:SIZE`, where `SIZE` is a byte count with an
/// optional `K`, `M`, `G` or `T` suffix (powers of 1024).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub path: PathBuf,
    pub capacity: Option<u64>,
    /// Ceiling on the catalog's SQLite page count. Not settable from `PATH:SIZE`.
    pub catalog_pages: Option<u64>,
}

impl VolumeSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            capacity: None,
            catalog_pages: None,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_catalog_pages(mut self, pages: u64) -> Self {
        self.catalog_pages = Some(pages);
        self
    }
}

impl FromStr for VolumeSpec {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            bail!("volume path is empty");
        }
        if let Some((path, size)) = raw.rsplit_once(':') {
            if !path.is_empty() {
                if let Ok(capacity) = parse_size(size) {
                    return Ok(Self::new(path).with_capacity(capacity));
                }
            }
        }
        Ok(Self::new(raw))
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.capacity {
            Some(capacity) => write!(f, "{}:{capacity}", self.path.display()),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let (digits, shift) = match raw.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&raw[..raw.len() - 1], 10),
        Some('M') => (&raw[..raw.len() - 1], 20),
        Some('G') => (&raw[..raw.len() - 1], 30),
        Some('T') => (&raw[..raw.len() - 1], 40),
        _ => (raw, 0),
    };
    let value: u64 = digits.parse().with_context(|| format!("invalid size: {raw:?}"))?;
    value
        .checked_mul(1u64 << shift)
        .with_context(|| format!("size too large: {raw:?}"))
}

/// Operator answer when every queued volume is full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeChoice {
    Volume(VolumeSpec),
    Stop,
}

/// Decisions only a person at the console can make. Both calls may block
/// indefinitely.
pub trait Operator {
    /// A resumed run was started on `log_host` and continues on
    /// `current_host`. Returns whether to go on.
    fn confirm_host_mismatch(&mut self, log_host: &str, current_host: &str) -> Result<bool>;

    /// All queued volumes are used up.
    fn next_volume(&mut self) -> Result<VolumeChoice>;
}

impl<T: Operator + ?Sized> Operator for &mut T {
    fn confirm_host_mismatch(&mut self, log_host: &str, current_host: &str) -> Result<bool> {
        (**self).confirm_host_mismatch(log_host, current_host)
    }

    fn next_volume(&mut self) -> Result<VolumeChoice> {
        (**self).next_volume()
    }
}
