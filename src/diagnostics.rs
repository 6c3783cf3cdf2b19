//! User-facing report for launches that cannot continue.

use std::path::PathBuf;

use crate::start_log::{StartLog, NEWLINE};

const TROUBLESHOOTING: &str = "For trouble-shooting or to download the latest installer,";
const DOWNLOAD_SITE: &str = "please see www.cabrillo.edu/~dbrown/tracker/.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalKind {
    /// A jar was chosen but every attempt to start it failed.
    JarLaunchFailed { jar: PathBuf },
    /// No Tracker home could be found.
    NoTrackerHome { code_base: Option<PathBuf> },
    /// Tracker home found but it holds no usable jar.
    NoJar { jar_home: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalReport {
    pub kind: FatalKind,
    pub problems: String,
    pub start_log: Option<PathBuf>,
    pub version: String,
}

impl FatalReport {
    pub fn new(kind: FatalKind, log: &StartLog, start_log: Option<PathBuf>) -> Self {
        Self {
            kind,
            problems: log.exceptions().to_string(),
            start_log,
            version: log.version().to_string(),
        }
    }

    pub fn title(&self) -> String {
        format!("TrackerStarter Vers {}: Error Starting Tracker", self.version)
    }

    pub fn message(&self) -> String {
        let nl = NEWLINE;
        let mut text = match &self.kind {
            FatalKind::JarLaunchFailed { jar } => format!(
                "Tracker could not be started automatically due to{nl}\
                 the problem(s) listed below.  However, you may be able to{nl}\
                 start it directly by double-clicking the jar file{nl}{}.{nl}{nl}",
                jar.display()
            ),
            FatalKind::NoTrackerHome { code_base: Some(dir) } => format!(
                "It appears you have an incomplete Tracker installation, since{nl}\
                 no directory named \"Tracker\" could be found and {nl}\
                 no tracker.jar or tracker-x.xx.jar file exists in {nl}{}{nl}{nl}",
                dir.display()
            ),
            FatalKind::NoTrackerHome { code_base: None } => format!(
                "It appears you have an incomplete Tracker installation, since{nl}\
                 no directory named \"Tracker\" could be found and {nl}\
                 no tracker.jar or tracker-x.xx.jar file exists in the current directory.{nl}{nl}"
            ),
            FatalKind::NoJar { jar_home } => format!(
                "No tracker.jar or tracker-x.xx.jar was found in{nl}{}{nl}{nl}",
                jar_home.display()
            ),
        };
        if let Some(path) = &self.start_log {
            text.push_str(&format!("For more information see {}{nl}", path.display()));
        }
        let problems = if self.problems.is_empty() { "None" } else { self.problems.as_str() };
        text.push_str(&format!("{TROUBLESHOOTING}{nl}{DOWNLOAD_SITE}{nl}{nl}Problems:{nl}{problems}"));
        text
    }
}

/// Shows the report to the user: always on stderr, and as a message box when
/// built with the `dialogs` feature.
pub fn show_fatal(report: &FatalReport) {
    log::error!(target: "diagnostics", "{}", report.title());
    eprintln!("{}", report.title());
    eprintln!();
    eprintln!("{}", report.message());

    #[cfg(feature = "dialogs")]
    {
        rfd::MessageDialog::new()
            .set_level(rfd::MessageLevel::Error)
            .set_title(report.title())
            .set_description(report.message())
            .set_buttons(rfd::MessageButtons::Ok)
            .show();
    }
}
