//! Launch pipeline and retry state machine.
//!
//! `Launcher::launch` walks `ResolvingHome -> LoadingPrefs -> ResolvingJar ->
//! RefreshingEngines -> Launching` and then loops: a child that exits with an
//! out-of-memory complaint is retried with a smaller heap, one that rejects
//! 32-bit mode is retried in 64-bit mode, anything else is fatal.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

use crate::config_loader::{Platform, StarterSettings, TRACKER_RELAUNCH};
use crate::diagnostics::{FatalKind, FatalReport};
use crate::install;
use crate::jar_resolver;
use crate::preferences::{self, LaunchPreferences};
use crate::start_log::StartLog;
use crate::video_engines::{self, EngineWarnings};
use crate::watchdog::Watchdog;

pub const HEAP_FLOOR_MB: u32 = 64;
pub const HEAP_REDUCTION: f64 = 0.95;
/// Enough for any heap to shrink to the floor, plus the 32-bit fallback.
pub const MAX_LAUNCH_ATTEMPTS: u32 = 400;
const INITIAL_HEAP_FLAG: &str = "-Xms32m";
const HEAP_ERROR_MARKER: &str = "heap";
const BITNESS_ERROR_MARKER: &str = "32-bit";
pub const STARTER_WARNING_64_BIT: &str = "The Java VM was started in 64-bit mode (32-bit not support).";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Set(String),
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub executable: PathBuf,
    pub jvm_flags: Vec<String>,
    pub jar_path: PathBuf,
    pub passthrough_args: Vec<OsString>,
    pub environment: BTreeMap<String, EnvChange>,
}

impl LaunchCommand {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.executable.to_string_lossy().into_owned()];
        argv.extend(self.jvm_flags.iter().cloned());
        argv.push("-jar".to_string());
        argv.push(self.jar_path.to_string_lossy().into_owned());
        argv.extend(self.passthrough_args.iter().map(|a| a.to_string_lossy().into_owned()));
        argv
    }

    pub fn display_line(&self) -> String {
        self.argv().join(" ")
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        match self.environment.get(key)? {
            EnvChange::Set(value) => Some(value.as_str()),
            EnvChange::Remove => None,
        }
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.jvm_flags)
            .arg("-jar")
            .arg(&self.jar_path)
            .args(&self.passthrough_args);
        for (key, change) in &self.environment {
            match change {
                EnvChange::Set(value) => {
                    cmd.env(key, value);
                }
                EnvChange::Remove => {
                    cmd.env_remove(key);
                }
            }
        }
        cmd
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildProcessResult {
    pub exit_code: i32,
    pub stderr_text: String,
    pub stdout_text: String,
}

impl ChildProcessResult {
    /// Leading lines of stderr then stdout, each stream read up to its first
    /// blank line. Every line is prefixed with a newline and indent.
    pub fn error_lines(&self) -> String {
        let mut errors = String::new();
        for stream in [&self.stderr_text, &self.stdout_text] {
            for line in stream.lines().take_while(|l| !l.is_empty()) {
                errors.push_str("\n      ");
                errors.push_str(line);
            }
        }
        errors
    }
}

/// Spawns a child and waits for it to exit.
pub trait ProcessRunner {
    fn run(&mut self, command: &LaunchCommand) -> Result<ChildProcessResult>;
}

pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&mut self, command: &LaunchCommand) -> Result<ChildProcessResult> {
        let output = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to execute {}", command.executable.display()))?;
        Ok(ChildProcessResult {
            // killed by a signal: treat as a failure with no usable code
            exit_code: output.status.code().unwrap_or(-1),
            stderr_text: String::from_utf8_lossy(&output.stderr).into_owned(),
            stdout_text: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    ResolvingHome,
    LoadingPrefs,
    ResolvingJar,
    RefreshingEngines,
    Launching { attempt: u32, heap_mb: u32 },
    RetryingSmallerHeap { heap_mb: u32 },
    RetryingSixtyFourBit,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Succeeded,
    Failed(FatalReport),
}

/// Everything `build_command` needs for one attempt.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub platform: Platform,
    pub java_vm: Option<PathBuf>,
    pub java_home: Option<PathBuf>,
    pub jar_path: PathBuf,
    pub heap_mb: u32,
    pub preferred_heap_mb: u32,
    pub use_32_bit: bool,
    pub port: u16,
    pub tracker_home: Option<PathBuf>,
    pub xuggle_home: Option<PathBuf>,
    pub library_path: Option<String>,
    pub engine_warnings: EngineWarnings,
    pub starter_warning: Option<String>,
    pub relaunching: bool,
}

impl LaunchContext {
    pub fn new(settings: &StarterSettings, prefs: &LaunchPreferences, jar_path: PathBuf) -> Self {
        Self {
            platform: settings.platform,
            java_vm: prefs.java_vm.clone(),
            java_home: settings.java_home.clone(),
            jar_path,
            heap_mb: prefs.heap_mb,
            preferred_heap_mb: prefs.heap_mb,
            use_32_bit: prefs.use_32_bit,
            port: settings.port,
            tracker_home: None,
            xuggle_home: None,
            library_path: settings.library_path.clone(),
            engine_warnings: EngineWarnings::default(),
            starter_warning: None,
            relaunching: settings.relaunching,
        }
    }

    pub fn java_executable(&self) -> PathBuf {
        if let Some(vm) = &self.java_vm {
            return vm.clone();
        }
        match &self.java_home {
            Some(home) => home.join("bin").join(self.platform.java_binary_name()),
            None => PathBuf::from("java"),
        }
    }
}

fn set_or_remove(env: &mut BTreeMap<String, EnvChange>, key: &str, value: Option<String>) {
    let change = value.map(EnvChange::Set).unwrap_or(EnvChange::Remove);
    env.insert(key.to_string(), change);
}

/// Assembles the command line and child environment for one attempt.
pub fn build_command(ctx: &LaunchContext, args: &[OsString], log: &mut StartLog) -> LaunchCommand {
    let mut jvm_flags = Vec::new();
    if ctx.heap_mb > 0 {
        jvm_flags.push(INITIAL_HEAP_FLAG.to_string());
        jvm_flags.push(format!("-Xmx{}m", ctx.heap_mb));
    }
    if ctx.platform == Platform::MacOs {
        jvm_flags.push(if ctx.use_32_bit { "-d32" } else { "-d64" }.to_string());
        jvm_flags.push("-Xdock:name=Tracker".to_string());
    }

    let mut env = BTreeMap::new();
    env.insert("TRACKER_PORT".to_string(), EnvChange::Set(ctx.port.to_string()));

    if ctx.heap_mb < ctx.preferred_heap_mb {
        log.message(format!("setting environment variable MEMORY_SIZE = {}", ctx.heap_mb));
        env.insert("MEMORY_SIZE".to_string(), EnvChange::Set(ctx.heap_mb.to_string()));
    } else {
        env.insert("MEMORY_SIZE".to_string(), EnvChange::Remove);
    }

    set_or_remove(&mut env, "XUGGLE_WARNING", ctx.engine_warnings.xuggle.clone());
    set_or_remove(&mut env, "QTJAVA_WARNING", ctx.engine_warnings.qtjava.clone());
    set_or_remove(&mut env, "STARTER_WARNING", ctx.starter_warning.clone());

    if let Some(home) = &ctx.tracker_home {
        log.message(format!("setting TRACKER_HOME = {}", home.display()));
        env.insert("TRACKER_HOME".to_string(), EnvChange::Set(home.to_string_lossy().into_owned()));
    }

    if let Some(xuggle) = ctx.xuggle_home.as_ref().filter(|p| p.exists()) {
        log.message(format!("setting XUGGLE_HOME = {}", xuggle.display()));
        env.insert("XUGGLE_HOME".to_string(), EnvChange::Set(xuggle.to_string_lossy().into_owned()));

        let lib_dir = xuggle.join(ctx.platform.library_subdir());
        if lib_dir.exists() {
            let var = ctx.platform.library_path_var();
            let lib = lib_dir.to_string_lossy().into_owned();
            let current = ctx.library_path.clone().unwrap_or_default();
            let value = if current.starts_with(&lib) {
                current
            } else if current.is_empty() {
                lib
            } else {
                format!("{}{}{}", lib, ctx.platform.path_list_separator(), current)
            };
            log.message(format!("setting {} = {}", var, value));
            env.insert(var.to_string(), EnvChange::Set(value));
        }
    }

    if ctx.relaunching {
        env.insert(TRACKER_RELAUNCH.to_string(), EnvChange::Set("true".to_string()));
    } else {
        env.insert(TRACKER_RELAUNCH.to_string(), EnvChange::Remove);
    }

    LaunchCommand {
        executable: ctx.java_executable(),
        jvm_flags,
        jar_path: ctx.jar_path.clone(),
        passthrough_args: args.to_vec(),
        environment: env,
    }
}

/// Next heap size after an out-of-memory failure, or `None` below the floor.
pub fn reduce_heap(heap_mb: u32) -> Option<u32> {
    let next = (f64::from(heap_mb) * HEAP_REDUCTION) as u32;
    (next >= HEAP_FLOOR_MB).then_some(next)
}

enum Retry {
    SmallerHeap(u32),
    SixtyFourBit,
    GiveUp,
}

fn next_step(ctx: &LaunchContext, errors: &str) -> Retry {
    if errors.contains(HEAP_ERROR_MARKER) {
        return match reduce_heap(ctx.heap_mb) {
            Some(heap) => Retry::SmallerHeap(heap),
            None => Retry::GiveUp,
        };
    }
    if errors.contains(BITNESS_ERROR_MARKER) && ctx.use_32_bit {
        return Retry::SixtyFourBit;
    }
    Retry::GiveUp
}

pub struct Launcher<R: ProcessRunner> {
    settings: StarterSettings,
    runner: R,
    log: StartLog,
    watchdog: Option<Watchdog>,
    state: LaunchState,
    start_log_path: Option<PathBuf>,
}

impl<R: ProcessRunner> Launcher<R> {
    pub fn new(settings: StarterSettings, runner: R, log: StartLog) -> Self {
        Self {
            settings,
            runner,
            log,
            watchdog: None,
            state: LaunchState::Idle,
            start_log_path: None,
        }
    }

    /// Arms `watchdog` before every spawn.
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    pub fn log(&self) -> &StartLog {
        &self.log
    }

    fn enter(&mut self, state: LaunchState) {
        log::debug!(target: "launcher", "{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs the whole pipeline with `args` passed through to Tracker.
    pub fn launch(&mut self, args: &[OsString]) -> LaunchOutcome {
        let arg_text = if args.is_empty() {
            "null".to_string()
        } else {
            args.iter().map(|a| format!("\"{}\" ", a.to_string_lossy())).collect()
        };
        self.log.message(format!("launching with main arguments: {}", arg_text));
        self.start_log_path = None;

        self.enter(LaunchState::ResolvingHome);
        let tracker_home = match install::find_tracker_home(&self.settings, &mut self.log) {
            Ok(home) => home,
            Err(e) => {
                self.log.exception(&e);
                let code_base = self.settings.code_base_dir.clone();
                return self.fail(FatalKind::NoTrackerHome { code_base }, None);
            }
        };
        let xuggle_home = match install::find_xuggle_home(&self.settings, Some(&tracker_home), &mut self.log) {
            Ok(home) => Some(home),
            Err(e) => {
                self.log.exception(&e);
                None
            }
        };

        self.enter(LaunchState::LoadingPrefs);
        let prefs = preferences::load_preferences(&self.settings, &tracker_home, &mut self.log);
        preferences::run_executables(&prefs.run, &tracker_home, &mut self.log);

        self.enter(LaunchState::ResolvingJar);
        let jar_path = match &prefs.jar_path_override {
            Some(path) => path.clone(),
            None => {
                let jar_home = install::jar_home(&self.settings, &tracker_home);
                self.log.message(format!(
                    "{}: looking for tracker jars in {}",
                    self.settings.platform.name(),
                    jar_home.display()
                ));
                match jar_resolver::resolve_jar(&jar_home, prefs.preferred_jar.as_ref(), &mut self.log) {
                    Ok(jar) => jar.path,
                    Err(e) => {
                        self.log.exception(&e);
                        return self.fail(FatalKind::NoJar { jar_home }, Some(&tracker_home));
                    }
                }
            }
        };

        self.enter(LaunchState::RefreshingEngines);
        let jre_root = video_engines::jre_root_for(prefs.java_vm.as_deref(), self.settings.java_home.as_deref());
        let qt_sources = video_engines::qtjava_candidates(self.settings.platform, self.settings.system_root.as_deref());
        let engine_warnings =
            video_engines::refresh_video_engines(jre_root.as_deref(), xuggle_home.as_deref(), &qt_sources, &mut self.log);

        let mut ctx = LaunchContext::new(&self.settings, &prefs, jar_path);
        ctx.tracker_home = Some(tracker_home.clone());
        ctx.xuggle_home = xuggle_home;
        ctx.engine_warnings = engine_warnings;

        match self.run_attempts(&mut ctx, args, &tracker_home) {
            Ok(()) => {
                self.enter(LaunchState::Succeeded);
                LaunchOutcome::Succeeded
            }
            Err(e) => {
                self.log.exception(&e);
                let jar = ctx.jar_path.clone();
                self.fail(FatalKind::JarLaunchFailed { jar }, Some(&tracker_home))
            }
        }
    }

    fn run_attempts(&mut self, ctx: &mut LaunchContext, args: &[OsString], tracker_home: &Path) -> Result<()> {
        let log_dirs = self.settings.log_dirs(Some(tracker_home));

        for attempt in 1..=MAX_LAUNCH_ATTEMPTS {
            self.enter(LaunchState::Launching { attempt, heap_mb: ctx.heap_mb });
            let mut command = build_command(ctx, args, &mut self.log);
            self.log.message(format!("executing command: {}", command.display_line()));

            self.log.write_code_base_log(self.settings.code_base_dir.as_deref());
            if let Some(path) = self.log.write_user_log(&log_dirs) {
                command
                    .environment
                    .insert("START_LOG".to_string(), EnvChange::Set(path.to_string_lossy().into_owned()));
                self.start_log_path = Some(path);
            }

            if let Some(watchdog) = &self.watchdog {
                watchdog.arm();
            }
            let result = self.runner.run(&command)?;
            if result.exit_code == 0 {
                return Ok(());
            }

            let errors = result.error_lines();
            self.log.message(format!(
                "failed to start with memory size {}MB due to the following errors:{}",
                ctx.heap_mb, errors
            ));
            match next_step(ctx, &errors) {
                Retry::SmallerHeap(heap_mb) => {
                    self.log.message(format!("try to start with smaller memory size {}MB", heap_mb));
                    self.enter(LaunchState::RetryingSmallerHeap { heap_mb });
                    ctx.heap_mb = heap_mb;
                }
                Retry::SixtyFourBit => {
                    self.log.message("try to start in 64-bit mode");
                    self.enter(LaunchState::RetryingSixtyFourBit);
                    ctx.use_32_bit = false;
                    ctx.starter_warning = Some(STARTER_WARNING_64_BIT.to_string());
                }
                Retry::GiveUp => {
                    self.log.problem(&errors);
                    return Err(anyhow!("Tracker exited with code {}", result.exit_code));
                }
            }
        }
        Err(anyhow!("gave up after {} launch attempts", MAX_LAUNCH_ATTEMPTS))
    }

    fn fail(&mut self, kind: FatalKind, tracker_home: Option<&Path>) -> LaunchOutcome {
        self.enter(LaunchState::Failed);
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        let dirs = self.settings.log_dirs(tracker_home);
        let written = self.log.write_user_log(&dirs);
        let start_log = self.start_log_path.clone().or(written);
        LaunchOutcome::Failed(FatalReport::new(kind, &self.log, start_log))
    }
}

impl<R: ProcessRunner + Send + 'static> Launcher<R> {
    /// Starts a fresh launch on a background thread. With `second_try` the
    /// child sees `TRACKER_RELAUNCH=true`.
    pub fn relaunch(mut self, args: Vec<OsString>, second_try: bool) -> JoinHandle<LaunchOutcome> {
        thread::spawn(move || {
            self.settings.relaunching = second_try;
            self.log = StartLog::new(self.log.is_enabled());
            self.log.message("relaunch initiated by Tracker");
            self.launch(&args)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_loader::Overrides;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeRunner {
        results: Arc<Mutex<VecDeque<ChildProcessResult>>>,
        commands: Arc<Mutex<Vec<LaunchCommand>>>,
    }

    impl FakeRunner {
        fn with_results(results: Vec<ChildProcessResult>) -> Self {
            Self {
                results: Arc::new(Mutex::new(results.into())),
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<LaunchCommand> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl ProcessRunner for FakeRunner {
        fn run(&mut self, command: &LaunchCommand) -> Result<ChildProcessResult> {
            self.commands.lock().unwrap().push(command.clone());
            Ok(self.results.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn failure(stderr: &str) -> ChildProcessResult {
        ChildProcessResult {
            exit_code: 1,
            stderr_text: stderr.to_string(),
            stdout_text: String::new(),
        }
    }

    const HEAP_ERROR: &str = "Error occurred during initialization of VM\nCould not reserve enough space for object heap\n";

    struct Install {
        home: tempfile::TempDir,
        user: tempfile::TempDir,
    }

    fn install_with(jars: &[&str]) -> Install {
        let home = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        for jar in jars {
            fs::write(home.path().join(jar), b"PK").unwrap();
        }
        Install { home, user }
    }

    fn settings_for(install: &Install) -> StarterSettings {
        StarterSettings {
            code_base_dir: Some(install.home.path().to_path_buf()),
            user_home: Some(install.user.path().to_path_buf()),
            platform: Platform::Linux,
            ..StarterSettings::default()
        }
    }

    fn context(heap_mb: u32) -> LaunchContext {
        LaunchContext {
            platform: Platform::Linux,
            java_vm: None,
            java_home: None,
            jar_path: PathBuf::from("/opt/tracker/tracker.jar"),
            heap_mb,
            preferred_heap_mb: heap_mb,
            use_32_bit: false,
            port: 12321,
            tracker_home: Some(PathBuf::from("/opt/tracker")),
            xuggle_home: None,
            library_path: None,
            engine_warnings: EngineWarnings::default(),
            starter_warning: None,
            relaunching: false,
        }
    }

    #[test]
    fn command_line_with_heap() {
        let mut log = StartLog::new(true);
        let cmd = build_command(&context(512), &[OsString::from("video.trk")], &mut log);
        assert_eq!(
            cmd.argv(),
            vec!["java", "-Xms32m", "-Xmx512m", "-jar", "/opt/tracker/tracker.jar", "video.trk"]
        );
        assert_eq!(cmd.env_value("TRACKER_HOME"), Some("/opt/tracker"));
        assert_eq!(cmd.env_value("TRACKER_PORT"), Some("12321"));
        assert_eq!(cmd.environment.get("MEMORY_SIZE"), Some(&EnvChange::Remove));
        assert_eq!(cmd.environment.get(TRACKER_RELAUNCH), Some(&EnvChange::Remove));
        assert_eq!(cmd.environment.get("XUGGLE_WARNING"), Some(&EnvChange::Remove));
    }

    #[test]
    fn command_line_on_mac_without_heap() {
        let mut ctx = context(0);
        ctx.platform = Platform::MacOs;
        ctx.use_32_bit = true;
        ctx.java_home = Some(PathBuf::from("/Library/Java/Home"));
        let mut log = StartLog::new(true);
        let cmd = build_command(&ctx, &[], &mut log);
        assert_eq!(
            cmd.display_line(),
            "/Library/Java/Home/bin/java -d32 -Xdock:name=Tracker -jar /opt/tracker/tracker.jar"
        );
    }

    #[test]
    fn reduced_heap_and_warnings_reach_environment() {
        let mut ctx = context(243);
        ctx.preferred_heap_mb = 256;
        ctx.relaunching = true;
        ctx.starter_warning = Some(STARTER_WARNING_64_BIT.to_string());
        ctx.engine_warnings.qtjava = Some("copy QTJava.zip".to_string());
        let mut log = StartLog::new(true);
        let cmd = build_command(&ctx, &[], &mut log);
        assert_eq!(cmd.env_value("MEMORY_SIZE"), Some("243"));
        assert_eq!(cmd.env_value(TRACKER_RELAUNCH), Some("true"));
        assert_eq!(cmd.env_value("STARTER_WARNING"), Some(STARTER_WARNING_64_BIT));
        assert_eq!(cmd.env_value("QTJAVA_WARNING"), Some("copy QTJava.zip"));
        assert!(log.text().contains("setting environment variable MEMORY_SIZE = 243"));
    }

    #[test]
    fn xuggle_library_dir_prefixes_library_path() {
        let xuggle = tempfile::tempdir().unwrap();
        fs::create_dir_all(xuggle.path().join("lib")).unwrap();
        let lib = xuggle.path().join("lib").to_string_lossy().into_owned();

        let mut ctx = context(0);
        ctx.xuggle_home = Some(xuggle.path().to_path_buf());
        ctx.library_path = Some("/usr/lib".to_string());
        let mut log = StartLog::new(true);
        let cmd = build_command(&ctx, &[], &mut log);
        assert_eq!(cmd.env_value("LD_LIBRARY_PATH"), Some(format!("{}:/usr/lib", lib).as_str()));
        assert_eq!(cmd.env_value("XUGGLE_HOME"), Some(xuggle.path().to_string_lossy().as_ref()));

        // already first: left alone
        ctx.library_path = Some(format!("{}:/usr/lib", lib));
        let cmd = build_command(&ctx, &[], &mut log);
        assert_eq!(cmd.env_value("LD_LIBRARY_PATH"), Some(format!("{}:/usr/lib", lib).as_str()));
    }

    #[test]
    fn arguments_pass_through_verbatim() {
        let args: Vec<OsString> = ["--", "-Xmx4g", "--help", "my video.trk"].iter().map(OsString::from).collect();
        let mut log = StartLog::new(true);
        let cmd = build_command(&context(0), &args, &mut log);
        assert_eq!(cmd.passthrough_args, args);

        let command = cmd.to_command();
        let passed: Vec<&std::ffi::OsStr> = command.get_args().skip(2).collect();
        assert_eq!(passed, args.iter().map(OsString::as_os_str).collect::<Vec<_>>());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_argument_reaches_child_unchanged() {
        use std::os::unix::ffi::OsStringExt;

        let raw = OsString::from_vec(vec![b'f', 0xff, b'.', b't', b'r', b'k']);
        let mut log = StartLog::new(true);
        let cmd = build_command(&context(0), &[raw.clone()], &mut log);

        let command = cmd.to_command();
        assert_eq!(command.get_args().last(), Some(raw.as_os_str()));
        assert!(cmd.display_line().ends_with("f\u{FFFD}.trk"));
    }

    #[test]
    fn heap_reduction_sequence() {
        let mut heap = 256;
        let mut sequence = vec![heap];
        while let Some(next) = reduce_heap(heap) {
            sequence.push(next);
            heap = next;
        }
        assert_eq!(
            sequence,
            vec![
                256, 243, 230, 218, 207, 196, 186, 176, 167, 158, 150, 142, 134, 127, 120, 114, 108, 102, 96, 91,
                86, 81, 76, 72, 68, 64
            ]
        );
        assert_eq!(reduce_heap(0), None);
    }

    #[test]
    fn error_lines_stop_at_blank_line() {
        let result = ChildProcessResult {
            exit_code: 1,
            stderr_text: "first\nsecond\n\nignored\n".to_string(),
            stdout_text: "out\n".to_string(),
        };
        assert_eq!(result.error_lines(), "\n      first\n      second\n      out");
    }

    #[test]
    fn successful_launch() {
        let install = install_with(&["tracker.jar", "tracker-4.97.jar"]);
        let runner = FakeRunner::default();
        let mut launcher = Launcher::new(settings_for(&install), runner.clone(), StartLog::new(true));

        let outcome = launcher.launch(&[OsString::from("a.trk")]);
        assert_eq!(outcome, LaunchOutcome::Succeeded);
        assert_eq!(launcher.state(), LaunchState::Succeeded);

        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].jar_path, install.home.path().join("tracker.jar"));
        let start_log = commands[0].env_value("START_LOG").unwrap();
        assert_eq!(start_log, install.home.path().join("tracker_start.log").to_string_lossy());
        assert!(launcher.log().text().contains("launching with main arguments: \"a.trk\" "));
    }

    #[test]
    fn disabled_log_is_never_written() {
        let install = install_with(&["tracker.jar"]);
        let runner = FakeRunner::default();
        let mut launcher = Launcher::new(settings_for(&install), runner.clone(), StartLog::new(false));

        assert_eq!(launcher.launch(&[]), LaunchOutcome::Succeeded);
        assert_eq!(runner.commands()[0].env_value("START_LOG"), None);
        assert!(!install.home.path().join("tracker_start.log").exists());
        assert!(launcher.log().is_empty());
    }

    #[test]
    fn heap_failures_shrink_until_floor() {
        let install = install_with(&["tracker.jar"]);
        let mut settings = settings_for(&install);
        settings.overrides = Overrides {
            memory_size: Some("256".into()),
            ..Overrides::default()
        };
        let runner = FakeRunner::with_results(vec![failure(HEAP_ERROR); 100]);
        let mut launcher = Launcher::new(settings, runner.clone(), StartLog::new(true));

        let outcome = launcher.launch(&[]);
        let heaps: Vec<String> = runner
            .commands()
            .iter()
            .map(|c| c.jvm_flags[1].clone())
            .collect();
        assert_eq!(heaps.len(), 26);
        assert_eq!(heaps[0], "-Xmx256m");
        assert_eq!(heaps[1], "-Xmx243m");
        assert_eq!(heaps[25], "-Xmx64m");
        assert_eq!(runner.commands()[1].env_value("MEMORY_SIZE"), Some("243"));

        match outcome {
            LaunchOutcome::Failed(report) => {
                assert_eq!(report.kind, FatalKind::JarLaunchFailed { jar: install.home.path().join("tracker.jar") });
                assert!(report.problems.contains("Could not reserve enough space for object heap"));
                assert!(report.start_log.is_some());
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(launcher.state(), LaunchState::Failed);
    }

    #[test]
    fn heap_retry_then_success() {
        let install = install_with(&["tracker.jar"]);
        let mut settings = settings_for(&install);
        settings.overrides.memory_size = Some("1024".into());
        let runner = FakeRunner::with_results(vec![failure(HEAP_ERROR), ChildProcessResult::default()]);
        let mut launcher = Launcher::new(settings, runner.clone(), StartLog::new(true));

        assert_eq!(launcher.launch(&[]), LaunchOutcome::Succeeded);
        let commands = runner.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].jvm_flags[1], "-Xmx972m");
    }

    #[test]
    fn thirty_two_bit_rejection_retries_once_in_64_bit() {
        let install = install_with(&["tracker.jar"]);
        let mut settings = settings_for(&install);
        settings.platform = Platform::MacOs;
        settings.overrides.vm_bitness = Some("32".into());
        let rejection = failure("Error: This Java instance does not support a 32-bit JVM.");
        let runner = FakeRunner::with_results(vec![rejection.clone(), rejection]);
        let mut launcher = Launcher::new(settings, runner.clone(), StartLog::new(true));

        let outcome = launcher.launch(&[]);
        let commands = runner.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].jvm_flags.contains(&"-d32".to_string()));
        assert!(commands[1].jvm_flags.contains(&"-d64".to_string()));
        assert_eq!(commands[1].env_value("STARTER_WARNING"), Some(STARTER_WARNING_64_BIT));
        assert!(matches!(outcome, LaunchOutcome::Failed(_)));
    }

    #[test]
    fn other_failure_is_fatal_immediately() {
        let install = install_with(&["tracker.jar"]);
        let runner = FakeRunner::with_results(vec![failure("Error: Invalid or corrupt jarfile")]);
        let mut launcher = Launcher::new(settings_for(&install), runner.clone(), StartLog::new(true));

        match launcher.launch(&[]) {
            LaunchOutcome::Failed(report) => {
                assert!(report.problems.contains("Invalid or corrupt jarfile"));
                assert!(report.message().contains("double-clicking the jar file"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn missing_home_reports_code_base() {
        let empty = tempfile::tempdir().unwrap();
        let settings = StarterSettings {
            code_base_dir: Some(empty.path().to_path_buf()),
            platform: Platform::Linux,
            ..StarterSettings::default()
        };
        let runner = FakeRunner::default();
        let mut launcher = Launcher::new(settings, runner.clone(), StartLog::new(true));

        match launcher.launch(&[]) {
            LaunchOutcome::Failed(report) => {
                assert_eq!(report.kind, FatalKind::NoTrackerHome { code_base: Some(empty.path().to_path_buf()) });
                assert!(report.problems.contains("trackerhome not found"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn jar_override_skips_resolution() {
        let install = install_with(&["tracker.jar"]);
        let mut settings = settings_for(&install);
        let pinned = install.home.path().join("tracker-5.0.jar");
        settings.overrides.tracker_jar = Some(pinned.clone());
        let runner = FakeRunner::default();
        let mut launcher = Launcher::new(settings, runner.clone(), StartLog::new(true));

        assert_eq!(launcher.launch(&[]), LaunchOutcome::Succeeded);
        assert_eq!(runner.commands()[0].jar_path, pinned);
    }

    #[test]
    fn relaunch_marks_second_try() {
        let install = install_with(&["tracker.jar"]);
        let runner = FakeRunner::default();
        let launcher = Launcher::new(settings_for(&install), runner.clone(), StartLog::new(true));

        let outcome = launcher.relaunch(vec![OsString::from("b.trk")], true).join().unwrap();
        assert_eq!(outcome, LaunchOutcome::Succeeded);
        let commands = runner.commands();
        assert_eq!(commands[0].env_value(TRACKER_RELAUNCH), Some("true"));
        assert_eq!(commands[0].passthrough_args, vec![OsString::from("b.trk")]);
    }

    #[test]
    fn relaunch_keeps_log_setting() {
        let install = install_with(&["tracker.jar"]);
        let runner = FakeRunner::default();
        let launcher = Launcher::new(settings_for(&install), runner.clone(), StartLog::new(false));

        let outcome = launcher.relaunch(Vec::new(), false).join().unwrap();
        assert_eq!(outcome, LaunchOutcome::Succeeded);
        assert_eq!(runner.commands()[0].env_value("START_LOG"), None);
        assert!(!install.home.path().join("tracker_start.log").exists());
    }
}
