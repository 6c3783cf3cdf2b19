//! Picks which Tracker jar to launch.
//!
//! Candidates are `tracker.jar`, `tracker-<n>.jar` and `tracker-<n>-snapshot.jar`.
//! A pinned version wins when its number and label both match; otherwise the bare
//! `tracker.jar`, otherwise the highest numbered jar.

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::start_log::StartLog;

pub const DEFAULT_JAR_NAME: &str = "tracker.jar";
const JAR_PREFIX: &str = "tracker-";
const JAR_SUFFIX: &str = ".jar";
const SNAPSHOT_SUFFIX: &str = "-snapshot";

/// Version of a numbered jar: `number` is used for ordering, `label` is the
/// exact text between `tracker-` and `.jar`.
#[derive(Debug, Clone, PartialEq)]
pub struct JarVersion {
    pub number: f64,
    pub label: String,
}

impl JarVersion {
    /// Parses a version label such as `4.86` or `5.0-snapshot`.
    pub fn parse(label: &str) -> Option<Self> {
        let lower = label.to_ascii_lowercase();
        let numeric = lower.strip_suffix(SNAPSHOT_SUFFIX).unwrap_or(&lower);
        let number = parse_version_number(numeric)?;
        Some(Self {
            number,
            label: label.to_string(),
        })
    }

    /// Parses the version out of a `tracker-<label>.jar` file name.
    pub fn from_jar_name(file_name: &str) -> Option<Self> {
        match parse_candidate(file_name)? {
            JarCandidate { version: Some(v), .. } => Some(v),
            _ => None,
        }
    }

    pub fn matches(&self, other: &JarVersion) -> bool {
        self.number == other.number && self.label == other.label
    }
}

/// Parses a version number with the usual float syntax (`4.86`, `1e1`, `-2`).
/// `inf` and `NaN` are rejected.
pub fn parse_version_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

#[derive(Debug, Clone, PartialEq)]
pub struct JarCandidate {
    pub file_name: String,
    /// `None` for the bare `tracker.jar`.
    pub version: Option<JarVersion>,
}

/// Accepts or rejects a file name as a Tracker jar.
pub fn parse_candidate(file_name: &str) -> Option<JarCandidate> {
    let lower = file_name.to_ascii_lowercase();
    if lower == DEFAULT_JAR_NAME {
        return Some(JarCandidate {
            file_name: file_name.to_string(),
            version: None,
        });
    }
    if !lower.starts_with(JAR_PREFIX) || !lower.ends_with(JAR_SUFFIX) {
        return None;
    }
    if file_name.len() < JAR_PREFIX.len() + JAR_SUFFIX.len() {
        return None;
    }
    // ASCII lowercasing keeps byte offsets
    let label = &file_name[JAR_PREFIX.len()..file_name.len() - JAR_SUFFIX.len()];
    let version = JarVersion::parse(label)?;
    Some(JarCandidate {
        file_name: file_name.to_string(),
        version: Some(version),
    })
}

pub fn is_tracker_jar(file_name: &str) -> bool {
    parse_candidate(file_name).is_some()
}

/// Chooses among candidates: pinned match, then bare name, then highest number.
/// Only positive numbers take part in the highest-number pick.
pub fn select_jar<'a>(candidates: &'a [JarCandidate], pinned: Option<&JarVersion>) -> Option<&'a JarCandidate> {
    if let Some(pin) = pinned {
        let exact = candidates
            .iter()
            .find(|c| c.version.as_ref().is_some_and(|v| v.matches(pin)));
        if exact.is_some() {
            return exact;
        }
    }
    if let Some(bare) = candidates.iter().find(|c| c.version.is_none()) {
        return Some(bare);
    }
    let mut best: Option<&JarCandidate> = None;
    for candidate in candidates {
        let Some(version) = candidate.version.as_ref().filter(|v| v.number > 0.0) else { continue };
        let better = match best.and_then(|b| b.version.as_ref()) {
            Some(current) => version.number > current.number,
            None => true,
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

/// Lists the Tracker jars in `dir`, sorted by file name.
pub fn list_candidates(dir: &Path) -> Result<Vec<JarCandidate>> {
    let entries = fs::read_dir(dir).with_context(|| format!("cannot list {}", dir.display()))?;
    let mut candidates: Vec<JarCandidate> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| parse_candidate(&name))
        .collect();
    candidates.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(candidates)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedJar {
    pub path: PathBuf,
    pub version: Option<f64>,
}

/// No usable jar in the jar directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JarNotFound {
    pub dir: PathBuf,
}

impl fmt::Display for JarNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "No Tracker jar files found in {}", self.dir.display())
    }
}

impl std::error::Error for JarNotFound {}

/// Resolves the jar to launch from `dir`.
pub fn resolve_jar(dir: &Path, pinned: Option<&JarVersion>, log: &mut StartLog) -> Result<ResolvedJar> {
    let chosen = match list_candidates(dir) {
        Ok(candidates) => {
            if !candidates.is_empty() {
                let names: Vec<&str> = candidates.iter().map(|c| c.file_name.as_str()).collect();
                log.message(format!("tracker jars found: {}", names.join(", ")));
            }
            select_jar(&candidates, pinned).cloned()
        }
        Err(e) => {
            // directory could not be read: fall back to the unnumbered jar
            log.message(format!("{:#}", e));
            log.exception(&e);
            Some(JarCandidate {
                file_name: DEFAULT_JAR_NAME.to_string(),
                version: None,
            })
        }
    };

    if let Some(candidate) = chosen {
        let path = dir.join(&candidate.file_name);
        if path.is_file() {
            let path = absolute(&path);
            log.message(format!("using tracker jar: {}", path.display()));
            return Ok(ResolvedJar {
                path,
                version: candidate.version.map(|v| v.number),
            });
        }
    }
    Err(JarNotFound { dir: dir.to_path_buf() }.into())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
