//! Start log and exception trail.
//!
//! Every step of a launch appends a ` - ` prefixed line here (and mirrors it to
//! the `log` facade). Problems are collected separately into a plain-text trail
//! that ends up in the fatal dialog.

use chrono::{Local, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config_loader::{can_write, LOG_FILE_NAME};

pub const NEWLINE: &str = if cfg!(windows) { "\r\n" } else { "\n" };
const HEADER_PREFIX: &str = "TrackerStarter";

#[derive(Debug, Clone)]
pub struct StartLog {
    enabled: bool,
    version: String,
    text: String,
    exceptions: String,
}

impl StartLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            version: env!("CARGO_PKG_VERSION").to_string(),
            text: String::new(),
            exceptions: String::new(),
        }
    }

    pub fn message(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::info!(target: "tracker_starter", "{}", message);
        if self.enabled {
            self.text.push_str(" - ");
            self.text.push_str(message);
            self.text.push_str(NEWLINE);
        }
    }

    /// Adds an error to the exception trail.
    pub fn exception(&mut self, err: &anyhow::Error) {
        log::warn!(target: "tracker_starter", "{:#}", err);
        self.exceptions.push_str(&format!("{:#}", err));
        self.exceptions.push_str(NEWLINE);
    }

    /// Adds raw problem text (child process output, etc.) to the trail.
    pub fn problem(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        log::warn!(target: "tracker_starter", "{}", text.trim());
        self.exceptions.push_str(text);
        self.exceptions.push_str(NEWLINE);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn exceptions(&self) -> &str {
        &self.exceptions
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn add_header(&mut self) {
        if !self.text.starts_with(HEADER_PREFIX) {
            let header = header_line(&self.version, Local::now().naive_local());
            self.text = format!("{}{}{}{}", header, NEWLINE, NEWLINE, self.text);
        }
    }

    /// Writes the log to the first writable directory in `dirs`. Returns the
    /// path written, or `None` if nothing was logged or nothing could be written.
    pub fn write_user_log(&mut self, dirs: &[PathBuf]) -> Option<PathBuf> {
        if self.text.is_empty() {
            return None;
        }
        let dir = dirs.iter().find(|dir| can_write(dir))?;
        let file = dir.join(LOG_FILE_NAME);
        self.write_to(&file).then_some(file)
    }

    /// Writes a copy of the log next to the starter binary.
    pub fn write_code_base_log(&mut self, code_base_dir: Option<&Path>) {
        if self.text.is_empty() {
            return;
        }
        if let Some(dir) = code_base_dir.filter(|dir| can_write(dir)) {
            self.write_to(&dir.join(LOG_FILE_NAME));
        }
    }

    fn write_to(&mut self, file: &Path) -> bool {
        self.add_header();
        self.message(format!("writing start log to {}", file.display()));
        match fs::write(file, self.text.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                log::debug!(target: "tracker_starter", "start log not written to {}: {}", file.display(), e);
                false
            }
        }
    }
}

pub fn header_line(version: &str, now: NaiveDateTime) -> String {
    format!("{} version {}  {}", HEADER_PREFIX, version, now.format("%H:%M:%S  %b %d %Y"))
}
