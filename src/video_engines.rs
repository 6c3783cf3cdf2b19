//! Copies video engine support files into the chosen JVM's extensions folder.
//!
//! Failures never stop a launch. When a source exists but cannot be copied the
//! user gets a warning (via the child's environment) explaining what to copy
//! by hand.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config_loader::Platform;
use crate::start_log::StartLog;

pub const XUGGLE_JARS: [&str; 2] = ["xuggle-xuggler-server-all.jar", "slf4j-api.jar"];
pub const QTJAVA_ZIP: &str = "QTJava.zip";
const XUGGLE_JAR_SUBDIR: &str = "share/java/jars";

const COPY_WARNING: &str = "Some video engine files could not be copied automatically.\n\
                            The video engine may not work unless they are copied manually.";

/// Warning texts handed to the child as `XUGGLE_WARNING` / `QTJAVA_WARNING`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineWarnings {
    pub xuggle: Option<String>,
    pub qtjava: Option<String>,
}

/// Root of the JRE that will run Tracker: derived from the preferred `java`
/// executable (`<root>/bin/java`) or else `JAVA_HOME`.
pub fn jre_root_for(java_vm: Option<&Path>, java_home: Option<&Path>) -> Option<PathBuf> {
    if let Some(root) = java_vm.and_then(Path::parent).and_then(Path::parent) {
        return Some(root.to_path_buf());
    }
    java_home.map(Path::to_path_buf)
}

pub fn ext_dir(jre_root: &Path) -> PathBuf {
    jre_root.join("lib").join("ext")
}

/// Well-known QuickTime for Java locations.
pub fn qtjava_candidates(platform: Platform, system_root: Option<&Path>) -> Vec<PathBuf> {
    match platform {
        Platform::Windows => {
            let mut candidates = Vec::new();
            if let Some(root) = system_root {
                candidates.push(root.join("System32").join(QTJAVA_ZIP));
                candidates.push(root.join("SysWOW64").join(QTJAVA_ZIP));
            }
            for program_files in ["C:\\Program Files", "C:\\Program Files (x86)"] {
                candidates.push(Path::new(program_files).join("QuickTime").join("QTSystem").join(QTJAVA_ZIP));
            }
            candidates
        }
        Platform::MacOs => vec![PathBuf::from("/System/Library/Java/Extensions").join(QTJAVA_ZIP)],
        Platform::Linux => Vec::new(),
    }
}

fn copy_all(files: &[&str], from: &Path, to: &Path) -> Result<()> {
    for name in files {
        let target = to.join(name);
        if target.exists() {
            continue;
        }
        fs::copy(from.join(name), &target)
            .with_context(|| format!("cannot copy {} to {}", name, to.display()))?;
    }
    Ok(())
}

fn warning(files: &[&str], from: &Path, to: &Path) -> String {
    format!(
        "{}\n\nFiles to copy: {}\nCopy from: {}\nCopy to: {}",
        COPY_WARNING,
        files.join(", "),
        from.display(),
        to.display()
    )
}

fn refresh_xuggle(ext: &Path, xuggle_home: Option<&Path>, log: &mut StartLog) -> Option<String> {
    if XUGGLE_JARS.iter().all(|jar| ext.join(jar).exists()) {
        log.message(format!("xuggle jars found in {}", ext.display()));
        return None;
    }
    let Some(home) = xuggle_home else {
        log.message("xuggle jars not found: XUGGLE_HOME is undefined");
        return None;
    };
    let source = home.join(XUGGLE_JAR_SUBDIR);
    if !XUGGLE_JARS.iter().all(|jar| source.join(jar).is_file()) {
        log.message(format!("xuggle jars not found in {}", home.display()));
        return None;
    }
    match copy_all(&XUGGLE_JARS, &source, ext) {
        Ok(()) => {
            log.message(format!("copied xuggle jars to {}", ext.display()));
            None
        }
        Err(e) => {
            log.message(format!("unable to copy xuggle jars from {} to {}", source.display(), ext.display()));
            log.exception(&e);
            Some(warning(&XUGGLE_JARS, &source, ext))
        }
    }
}

fn refresh_qtjava(ext: &Path, qt_sources: &[PathBuf], log: &mut StartLog) -> Option<String> {
    if ext.join(QTJAVA_ZIP).exists() {
        log.message(format!("QTJava.zip found in {}", ext.display()));
        return None;
    }
    let Some(source) = qt_sources.iter().find(|p| p.is_file()) else {
        log.message("QTJava.zip not found");
        return None;
    };
    let source_dir = source.parent().unwrap_or(Path::new(""));
    match copy_all(&[QTJAVA_ZIP], source_dir, ext) {
        Ok(()) => {
            log.message(format!("copied QTJava.zip to {}", ext.display()));
            None
        }
        Err(e) => {
            log.message(format!("unable to copy {} to {}", source.display(), ext.display()));
            log.exception(&e);
            Some(warning(&[QTJAVA_ZIP], source_dir, ext))
        }
    }
}

/// Brings the extensions folder up to date and returns any copy warnings.
pub fn refresh_video_engines(
    jre_root: Option<&Path>,
    xuggle_home: Option<&Path>,
    qt_sources: &[PathBuf],
    log: &mut StartLog,
) -> EngineWarnings {
    let Some(root) = jre_root else {
        log.message("no java home: video engines not refreshed");
        return EngineWarnings::default();
    };
    let ext = ext_dir(root);
    EngineWarnings {
        xuggle: refresh_xuggle(&ext, xuggle_home, log),
        qtjava: refresh_qtjava(&ext, qt_sources, log),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xuggle_install(root: &Path) -> PathBuf {
        let home = root.join("Xuggle");
        let jars = home.join(XUGGLE_JAR_SUBDIR);
        fs::create_dir_all(&jars).unwrap();
        for jar in XUGGLE_JARS {
            fs::write(jars.join(jar), b"PK").unwrap();
        }
        home
    }

    #[test]
    fn jre_root_prefers_vm_over_java_home() {
        let vm = Path::new("/opt/jdk/jre/bin/java");
        assert_eq!(jre_root_for(Some(vm), Some(Path::new("/usr/lib/jvm"))), Some(PathBuf::from("/opt/jdk/jre")));
        assert_eq!(jre_root_for(None, Some(Path::new("/usr/lib/jvm"))), Some(PathBuf::from("/usr/lib/jvm")));
        assert_eq!(jre_root_for(None, None), None);
    }

    #[test]
    fn copies_missing_xuggle_jars() {
        let root = tempfile::tempdir().unwrap();
        let xuggle = xuggle_install(root.path());
        let jre = root.path().join("jre");
        fs::create_dir_all(ext_dir(&jre)).unwrap();

        let mut log = StartLog::new(true);
        let warnings = refresh_video_engines(Some(&jre), Some(&xuggle), &[], &mut log);

        assert_eq!(warnings, EngineWarnings::default());
        for jar in XUGGLE_JARS {
            assert!(ext_dir(&jre).join(jar).exists());
        }
        assert!(log.text().contains("QTJava.zip not found"));
    }

    #[test]
    fn failed_copy_produces_warning() {
        let root = tempfile::tempdir().unwrap();
        let xuggle = xuggle_install(root.path());
        let qt_dir = root.path().join("QuickTime");
        fs::create_dir_all(&qt_dir).unwrap();
        fs::write(qt_dir.join(QTJAVA_ZIP), b"PK").unwrap();
        // no lib/ext directory, so every copy fails
        let jre = root.path().join("jre");

        let mut log = StartLog::new(true);
        let warnings = refresh_video_engines(Some(&jre), Some(&xuggle), &[qt_dir.join(QTJAVA_ZIP)], &mut log);

        let xuggle_warning = warnings.xuggle.unwrap();
        assert!(xuggle_warning.starts_with("Some video engine files could not be copied automatically."));
        assert!(xuggle_warning.contains("Files to copy: xuggle-xuggler-server-all.jar, slf4j-api.jar"));
        assert!(xuggle_warning.contains(&format!("Copy to: {}", ext_dir(&jre).display())));

        let qt_warning = warnings.qtjava.unwrap();
        assert!(qt_warning.contains("Files to copy: QTJava.zip"));
        assert!(qt_warning.contains(&format!("Copy from: {}", qt_dir.display())));
    }

    #[test]
    fn missing_xuggle_home_is_only_logged() {
        let root = tempfile::tempdir().unwrap();
        let mut log = StartLog::new(true);
        let warnings = refresh_video_engines(Some(root.path()), None, &[], &mut log);
        assert!(warnings.xuggle.is_none());
        assert!(log.text().contains("XUGGLE_HOME is undefined"));
    }

    #[test]
    fn qtjava_locations_per_platform() {
        assert!(qtjava_candidates(Platform::Linux, None).is_empty());
        let windows = qtjava_candidates(Platform::Windows, Some(Path::new("C:\\Windows")));
        assert_eq!(windows[0], Path::new("C:\\Windows").join("System32").join(QTJAVA_ZIP));
        assert_eq!(windows.len(), 4);
    }
}
