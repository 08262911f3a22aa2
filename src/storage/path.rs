//! Storage file naming
//!
//! Every (host, datasource) pair owns exactly one RRD file. Its location is a
//! pure function of the host, the datasource and the path mode:
//!
//! ```text
//! flat  {base}/{host}/{datasource}.rrd
//! name  {base}/{h[0]}/{h[0..2]}/{host}/{datasource}.rrd   h = encoded host
//! hash  {base}/{m[0]}/{m[0..2]}/{host}/{datasource}.rrd   m = md5(host) in hex
//! ```
//!
//! Both the host and the datasource are form-encoded so that no name can
//! escape its directory.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

/// Bytes kept verbatim in a path segment. Space is kept here and turned into
/// `+` afterwards.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b' ');

/// Directory layout of the RRD tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// One directory per host directly under the base directory
    #[default]
    Flat,
    /// Two extra levels taken from the first characters of the host name
    Name,
    /// Two extra levels taken from the MD5 digest of the host name
    Hash,
}

/// Encode one path segment the way HTML forms encode values
pub fn encode_segment(raw: &str) -> String {
    match raw {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => utf8_percent_encode(raw, SEGMENT).to_string().replace(' ', "+"),
    }
}

/// Maps (host, datasource) to the file that stores it
#[derive(Debug)]
pub struct PathResolver {
    base_dir: PathBuf,
    mode: PathMode,
    /// Host name to hash subdirectory, computed once per host
    hashes: DashMap<String, PathBuf>,
}

impl PathResolver {
    pub fn new(base_dir: impl Into<PathBuf>, mode: PathMode) -> Self {
        Self {
            base_dir: base_dir.into(),
            mode,
            hashes: DashMap::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn mode(&self) -> PathMode {
        self.mode
    }

    /// Path of the file for `host`/`datasource` with the configured mode
    pub fn path_for(&self, host: &str, datasource: &str) -> PathBuf {
        self.resolve(host, datasource, self.mode)
    }

    /// Path of the file for `host`/`datasource` under `mode`
    pub fn resolve(&self, host: &str, datasource: &str, mode: PathMode) -> PathBuf {
        let host_segment = encode_segment(host);
        let mut path = self.base_dir.clone();

        match mode {
            PathMode::Flat => {}
            PathMode::Name => {
                if let Some(sub) = two_levels(&host_segment) {
                    path.push(sub);
                }
            }
            PathMode::Hash => {
                let sub = self
                    .hashes
                    .entry(host.to_string())
                    .or_insert_with(|| {
                        let digest = format!("{:x}", md5::compute(host.as_bytes()));
                        two_levels(&digest).unwrap_or_default()
                    })
                    .clone();
                path.push(sub);
            }
        }

        path.push(host_segment);
        path.push(format!("{}.rrd", encode_segment(datasource)));
        path
    }

    /// Location used before subdirectory modes existed
    ///
    /// Files found there are moved to [`PathResolver::path_for`] instead of
    /// being created again.
    pub fn legacy_path(&self, host: &str, datasource: &str) -> PathBuf {
        self.resolve(host, datasource, PathMode::Flat)
    }
}

/// `abc` becomes `a/ab`; names shorter than two characters get no subdirectory
fn two_levels(name: &str) -> Option<PathBuf> {
    let mut chars = name.chars();
    let first = chars.next()?;
    let second = chars.next()?;

    let mut sub = PathBuf::from(first.to_string());
    sub.push(format!("{first}{second}"));
    Some(sub)
}
