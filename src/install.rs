//! Locates the Tracker installation and the optional Xuggle video engine.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

use crate::config_loader::{Platform, StarterSettings};
use crate::jar_resolver::{self, DEFAULT_JAR_NAME};
use crate::start_log::StartLog;

const XUGGLE_DIR_NAME: &str = "Xuggle";
const MAC_XUGGLE_HOME: &str = "/usr/local/xuggler";

/// Finds the Tracker home directory: the code base when it holds any Tracker
/// jar, else the current directory when it holds `tracker.jar`, else the
/// legacy `TRACKER_HOME` variable.
pub fn find_tracker_home(settings: &StarterSettings, log: &mut StartLog) -> Result<PathBuf> {
    let cwd = std::env::current_dir().ok();
    find_tracker_home_from(settings, cwd.as_deref(), log)
}

pub fn find_tracker_home_from(settings: &StarterSettings, cwd: Option<&Path>, log: &mut StartLog) -> Result<PathBuf> {
    if let Some(code_base) = &settings.code_base_dir {
        log.message(format!("code base: {}", code_base.display()));
        match jar_resolver::list_candidates(code_base) {
            Ok(jars) if !jars.is_empty() => {
                log.message("code base accepted as trackerhome based on contents");
                return Ok(accept(code_base.clone(), log));
            }
            Ok(_) => {}
            Err(e) => log.exception(&e),
        }
    }

    if let Some(dir) = cwd.filter(|dir| dir.join(DEFAULT_JAR_NAME).is_file()) {
        log.message("current directory accepted as trackerhome based on contents");
        return Ok(accept(dir.to_path_buf(), log));
    }

    let legacy = settings.tracker_home_var.as_ref();
    log.message(format!(
        "environment variable TRACKER_HOME: {}",
        legacy.map(|p| p.display().to_string()).unwrap_or_else(|| "null".into())
    ));
    match legacy {
        Some(dir) if dir.is_dir() => Ok(accept(dir.clone(), log)),
        Some(_) => {
            log.message("TRACKER_HOME directory no longer exists");
            Err(anyhow!("trackerhome not found"))
        }
        None => Err(anyhow!("trackerhome not found")),
    }
}

fn accept(dir: PathBuf, log: &mut StartLog) -> PathBuf {
    log.message(format!("using trackerhome: {}", dir.display()));
    dir
}

/// Finds the Xuggle home: a `Xuggle` child or sibling of the Tracker home,
/// `/usr/local/xuggler` on macOS, then `XUGGLE_HOME`.
pub fn find_xuggle_home(settings: &StarterSettings, tracker_home: Option<&Path>, log: &mut StartLog) -> Result<PathBuf> {
    if let Some(home) = tracker_home {
        let mut candidates = vec![home.join(XUGGLE_DIR_NAME)];
        if let Some(parent) = home.parent() {
            candidates.push(parent.join(XUGGLE_DIR_NAME));
        }
        if settings.platform == Platform::MacOs {
            candidates.push(PathBuf::from(MAC_XUGGLE_HOME));
        }
        if let Some(found) = candidates.into_iter().find(|c| c.is_dir()) {
            log.message(format!("xuggleHome found relative to TrackerHome: {}", found.display()));
            log.message(format!("using xuggleHome: {}", found.display()));
            return Ok(found);
        }
    }

    let var = settings.xuggle_home_var.as_ref();
    log.message(format!(
        "environment variable XUGGLE_HOME: {}",
        var.map(|p| p.display().to_string()).unwrap_or_else(|| "null".into())
    ));
    match var {
        Some(dir) if dir.exists() => {
            log.message(format!("using xuggleHome: {}", dir.display()));
            Ok(dir.clone())
        }
        Some(_) => {
            log.message("XUGGLE_HOME directory no longer exists");
            Err(anyhow!("xuggleHome not found"))
        }
        None => Err(anyhow!("xuggleHome not found")),
    }
}

/// Directory searched for Tracker jars. On macOS the jars live next to the
/// starter inside the app bundle rather than in the Tracker home.
pub fn jar_home(settings: &StarterSettings, tracker_home: &Path) -> PathBuf {
    match (&settings.platform, &settings.code_base_dir) {
        (Platform::MacOs, Some(code_base)) => code_base.clone(),
        _ => tracker_home.to_path_buf(),
    }
}
