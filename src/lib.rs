/// Tracker Starter Library
///
/// Launch pipeline for the Tracker video analysis tool and the loopback
/// bridge that lets later invocations hand files to a running instance.

pub mod config_loader;
pub mod diagnostics;
pub mod install;
pub mod jar_resolver;
pub mod launcher;
pub mod osp_socket;
pub mod preferences;
pub mod start_log;
pub mod video_engines;
pub mod watchdog;
