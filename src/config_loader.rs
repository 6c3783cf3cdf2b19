//! Run-level settings for the starter.
//!
//! Everything the launch pipeline needs to know about its surroundings (where
//! the starter binary lives, the user's home and documents folders, the
//! override variables) is gathered here once and threaded through as an
//! immutable `StarterSettings`.

use dotenvy::dotenv;
use std::env;
use std::path::{Path, PathBuf};

use crate::osp_socket;

pub const PREFS_FILE_NAME: &str = ".tracker.prefs";
pub const STARTER_PREFS_FILE_NAME: &str = ".tracker_starter.prefs";
pub const LOG_FILE_NAME: &str = "tracker_start.log";

// Override variables. Tracker sets these for itself before asking the starter
// to relaunch it; they trump anything read from the preferences file.
pub const PREFERRED_TRACKER_JAR: &str = "PREFERRED_TRACKER_JAR";
pub const PREFERRED_JAVA_VM: &str = "PREFERRED_JAVA_VM";
pub const PREFERRED_VM_BITNESS: &str = "PREFERRED_VM_BITNESS";
pub const PREFERRED_MEMORY_SIZE: &str = "PREFERRED_MEMORY_SIZE";
pub const PREFERRED_TRACKER_PREFS: &str = "PREFERRED_TRACKER_PREFS";
pub const TRACKER_RELAUNCH: &str = "TRACKER_RELAUNCH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::Windows => "Windows",
            Platform::MacOs => "Mac OSX",
            Platform::Linux => "Linux",
        }
    }

    /// Environment variable the dynamic linker searches for native libraries.
    pub fn library_path_var(self) -> &'static str {
        match self {
            Platform::Windows => "Path",
            Platform::MacOs => "DYLD_LIBRARY_PATH",
            Platform::Linux => "LD_LIBRARY_PATH",
        }
    }

    /// Subdirectory of a native library distribution holding the shared libraries.
    pub fn library_subdir(self) -> &'static str {
        match self {
            Platform::Windows => "bin",
            _ => "lib",
        }
    }

    pub fn path_list_separator(self) -> &'static str {
        match self {
            Platform::Windows => ";",
            _ => ":",
        }
    }

    pub fn java_binary_name(self) -> &'static str {
        match self {
            Platform::Windows => "java.exe",
            _ => "java",
        }
    }
}

/// Values read from the override variables, unparsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub prefs_file: Option<PathBuf>,
    pub vm_bitness: Option<String>,
    pub tracker_jar: Option<PathBuf>,
    pub java_vm: Option<String>,
    pub memory_size: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self {
            prefs_file: env_path(PREFERRED_TRACKER_PREFS),
            vm_bitness: env_string(PREFERRED_VM_BITNESS),
            tracker_jar: env_path(PREFERRED_TRACKER_JAR),
            java_vm: env_string(PREFERRED_JAVA_VM),
            memory_size: env_string(PREFERRED_MEMORY_SIZE),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StarterSettings {
    /// Directory containing the starter executable.
    pub code_base_dir: Option<PathBuf>,
    pub user_home: Option<PathBuf>,
    pub user_documents: Option<PathBuf>,
    pub java_home: Option<PathBuf>,
    /// Legacy `TRACKER_HOME` variable.
    pub tracker_home_var: Option<PathBuf>,
    /// `XUGGLE_HOME` variable.
    pub xuggle_home_var: Option<PathBuf>,
    /// Windows `SystemRoot`, searched for QuickTime support files.
    pub system_root: Option<PathBuf>,
    /// Current value of the platform's library path variable.
    pub library_path: Option<String>,
    pub overrides: Overrides,
    pub platform: Platform,
    pub port: u16,
    pub relaunching: bool,
}

impl Default for StarterSettings {
    fn default() -> Self {
        Self {
            code_base_dir: None,
            user_home: None,
            user_documents: None,
            java_home: None,
            tracker_home_var: None,
            xuggle_home_var: None,
            system_root: None,
            library_path: None,
            overrides: Overrides::default(),
            platform: Platform::current(),
            port: osp_socket::DEFAULT_PORT,
            relaunching: false,
        }
    }
}

impl StarterSettings {
    /// Collects settings from the process environment. Problems locating the
    /// code base are returned alongside so the caller can add them to the
    /// exception trail.
    pub fn from_env() -> (Self, Vec<String>) {
        // Load .env once here so all env-based settings are centralized
        let _ = dotenv();

        let mut problems = Vec::new();
        let code_base_dir = match env::current_exe() {
            Ok(exe) => exe.parent().map(Path::to_path_buf),
            Err(e) => {
                problems.push(format!("IOException: {}", e));
                None
            }
        };

        let user_home = env_path("HOME").or_else(|| env_path("USERPROFILE"));
        let user_documents = user_home
            .as_ref()
            .map(|home| home.join("Documents"))
            .filter(|docs| docs.is_dir());

        let platform = Platform::current();
        let settings = Self {
            code_base_dir,
            user_home,
            user_documents,
            java_home: env_path("JAVA_HOME"),
            tracker_home_var: env_path("TRACKER_HOME"),
            xuggle_home_var: env_path("XUGGLE_HOME"),
            system_root: env_path("SystemRoot"),
            library_path: env_string(platform.library_path_var()),
            overrides: Overrides::from_env(),
            platform,
            ..Self::default()
        };

        log::debug!(target: "config_loader", "StarterSettings: code_base={:?}, home={:?}, documents={:?}, java_home={:?}",
                    settings.code_base_dir, settings.user_home, settings.user_documents, settings.java_home);

        (settings, problems)
    }

    /// Candidate locations of the XML preferences file, most specific first.
    pub fn prefs_candidates(&self, tracker_home: &Path) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.overrides.prefs_file {
            candidates.push(path.clone());
        }
        if let Some(home) = &self.user_home {
            candidates.push(home.join(PREFS_FILE_NAME));
        }
        candidates.push(tracker_home.join(PREFS_FILE_NAME));
        if let Some(dir) = &self.code_base_dir {
            candidates.push(dir.join(PREFS_FILE_NAME));
        }
        candidates
    }

    /// Candidate locations of the deprecated line-oriented starter prefs.
    pub fn legacy_prefs_candidates(&self, tracker_home: &Path) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(home) = &self.user_home {
            candidates.push(home.join(STARTER_PREFS_FILE_NAME));
        }
        candidates.push(tracker_home.join(STARTER_PREFS_FILE_NAME));
        candidates
    }

    /// Directories the start log may be written to, in priority order.
    pub fn log_dirs(&self, tracker_home: Option<&Path>) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(home) = tracker_home {
            dirs.push(home.to_path_buf());
        }
        if let Some(docs) = &self.user_documents {
            dirs.push(docs.join("Tracker"));
            dirs.push(docs.clone());
        }
        if let Some(dir) = &self.code_base_dir {
            dirs.push(dir.clone());
        }
        dirs
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// True if the current user may create files in `path`.
#[cfg(unix)]
pub fn can_write(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
pub fn can_write(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_dirs(home: &Path, code_base: &Path) -> StarterSettings {
        StarterSettings {
            user_home: Some(home.to_path_buf()),
            code_base_dir: Some(code_base.to_path_buf()),
            ..StarterSettings::default()
        }
    }

    #[test]
    fn prefs_candidates_follow_override_home_install_codebase_order() {
        let mut settings = settings_with_dirs(Path::new("/home/u"), Path::new("/opt/starter"));
        settings.overrides.prefs_file = Some(PathBuf::from("/tmp/custom.prefs"));

        let candidates = settings.prefs_candidates(Path::new("/opt/tracker"));
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/tmp/custom.prefs"),
                PathBuf::from("/home/u/.tracker.prefs"),
                PathBuf::from("/opt/tracker/.tracker.prefs"),
                PathBuf::from("/opt/starter/.tracker.prefs"),
            ]
        );
    }

    #[test]
    fn log_dirs_skip_missing_documents() {
        let settings = settings_with_dirs(Path::new("/home/u"), Path::new("/opt/starter"));
        let dirs = settings.log_dirs(Some(Path::new("/opt/tracker")));
        assert_eq!(dirs, vec![PathBuf::from("/opt/tracker"), PathBuf::from("/opt/starter")]);
    }

    #[test]
    fn platform_library_variables() {
        assert_eq!(Platform::MacOs.library_path_var(), "DYLD_LIBRARY_PATH");
        assert_eq!(Platform::Linux.library_path_var(), "LD_LIBRARY_PATH");
        assert_eq!(Platform::Windows.library_subdir(), "bin");
        assert_eq!(Platform::Linux.library_subdir(), "lib");
    }

    #[test]
    fn can_write_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(can_write(dir.path()));
        assert!(!can_write(&dir.path().join("does-not-exist")));
    }
}
