//! Starts Tracker with the right jar, JVM and heap size.
//!
//! Every command-line argument is handed to Tracker unchanged. The process
//! exits with status 0 whether or not Tracker could be started; problems are
//! reported to the user instead.

use env_logger::Env;
use std::env;
use std::ffi::OsString;
use tracker_starter::config_loader::StarterSettings;
use tracker_starter::diagnostics::show_fatal;
use tracker_starter::launcher::{LaunchOutcome, Launcher, SystemRunner};
use tracker_starter::start_log::StartLog;
use tracker_starter::watchdog::{Watchdog, DEFAULT_GRACE};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    // No option parsing: `--`, `--help` and non-UTF-8 names all belong to Tracker.
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    let (settings, problems) = StarterSettings::from_env();
    let mut log = StartLog::new(true);
    log.message("launch initiated by user");
    for problem in problems {
        log.problem(problem);
    }

    // Tracker outlives the starter: once a child has survived the grace
    // period, leave it running and exit.
    let watchdog = Watchdog::spawn(DEFAULT_GRACE, || {
        log::info!(target: "tracker_starter", "Tracker is running, starter exiting");
        std::process::exit(0);
    });

    let mut launcher = Launcher::new(settings, SystemRunner, log).with_watchdog(watchdog);
    match launcher.launch(&args) {
        LaunchOutcome::Succeeded => {
            log::info!(target: "tracker_starter", "Tracker exited normally");
        }
        LaunchOutcome::Failed(report) => show_fatal(&report),
    }
    std::process::exit(0);
}
