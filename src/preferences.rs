//! Launch preferences.
//!
//! Two generations of preferences file are understood: the XML `.tracker.prefs`
//! document written by Tracker itself and the deprecated line-oriented
//! `.tracker_starter.prefs`. Environment overrides trump both.

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config_loader::{Platform, StarterSettings};
use crate::jar_resolver::{self, JarVersion, DEFAULT_JAR_NAME};
use crate::start_log::StartLog;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchPreferences {
    pub preferred_jar: Option<JarVersion>,
    /// Full jar path from `PREFERRED_TRACKER_JAR`; skips jar resolution.
    pub jar_path_override: Option<PathBuf>,
    /// Resolved `java` executable.
    pub java_vm: Option<PathBuf>,
    /// Maximum heap in MB; 0 means no explicit size.
    pub heap_mb: u32,
    pub run: Vec<String>,
    pub use_32_bit: bool,
    /// File the preferences were read from.
    pub source: Option<PathBuf>,
}

// -------------------- XML document --------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefValue {
    Scalar(String),
    Array(Vec<String>),
}

/// Top-level properties of an XML preferences document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefsDocument {
    values: BTreeMap<String, PrefValue>,
}

struct OpenProperty {
    name: String,
    value: PrefValue,
}

impl PrefsDocument {
    pub fn read(path: &Path) -> Result<Self> {
        let xml = fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
        Self::parse(&xml).with_context(|| format!("cannot parse {}", path.display()))
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut values = BTreeMap::new();
        let mut buf = Vec::new();
        let mut depth = 0usize;
        let mut saw_root = false;
        let mut open: Option<OpenProperty> = None;
        let mut items: Vec<(usize, String)> = Vec::new();
        let mut item: Option<(usize, String)> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    depth += 1;
                    match depth {
                        1 => {
                            check_root(e)?;
                            saw_root = true;
                        }
                        2 if e.name().as_ref() == b"property" => {
                            open = Some(open_property(e)?);
                            items.clear();
                        }
                        3 if e.name().as_ref() == b"property" => {
                            if matches!(open, Some(OpenProperty { value: PrefValue::Array(_), .. })) {
                                item = Some((array_index(e)?, String::new()));
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::Empty(ref e)) => match depth + 1 {
                    1 => {
                        check_root(e)?;
                        saw_root = true;
                    }
                    2 if e.name().as_ref() == b"property" => {
                        let property = open_property(e)?;
                        values.insert(property.name, property.value);
                    }
                    3 if e.name().as_ref() == b"property" => {
                        if matches!(open, Some(OpenProperty { value: PrefValue::Array(_), .. })) {
                            items.push((array_index(e)?, String::new()));
                        }
                    }
                    _ => {}
                },
                Ok(Event::Text(ref t)) => {
                    let text = t.unescape()?;
                    append_text(depth, &mut open, &mut item, &text);
                }
                Ok(Event::CData(ref t)) => {
                    let text = String::from_utf8_lossy(t);
                    append_text(depth, &mut open, &mut item, &text);
                }
                Ok(Event::End(_)) => {
                    match depth {
                        3 => {
                            if let Some(done) = item.take() {
                                items.push(done);
                            }
                        }
                        2 => {
                            if let Some(mut property) = open.take() {
                                if let PrefValue::Array(ref mut entries) = property.value {
                                    items.sort_by_key(|(index, _)| *index);
                                    entries.extend(items.drain(..).map(|(_, v)| v));
                                }
                                values.insert(property.name, property.value);
                            }
                        }
                        _ => {}
                    }
                    depth = depth.saturating_sub(1);
                }
                Ok(Event::Eof) => {
                    if depth > 0 {
                        bail!("document ends inside an open element");
                    }
                    break;
                }
                Err(e) => {
                    let pos = reader.buffer_position();
                    return Err(anyhow!("XML parse error at byte {}: {}", pos, e));
                }
                _ => {}
            }
            buf.clear();
        }

        if !saw_root {
            bail!("no <object> element found");
        }
        Ok(Self { values })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            PrefValue::Scalar(s) => Some(s.as_str()),
            PrefValue::Array(_) => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get_string(key).is_some_and(|s| s.trim().eq_ignore_ascii_case("true"))
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get_string(key)?.trim().parse().ok()
    }

    pub fn get_strings(&self, key: &str) -> Option<&[String]> {
        match self.values.get(key)? {
            PrefValue::Array(items) => Some(items.as_slice()),
            PrefValue::Scalar(_) => None,
        }
    }
}

fn check_root(e: &BytesStart) -> Result<()> {
    if e.name().as_ref() != b"object" {
        bail!("root element is <{}>, expected <object>", String::from_utf8_lossy(e.name().as_ref()));
    }
    Ok(())
}

fn attribute(e: &BytesStart, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn open_property(e: &BytesStart) -> Result<OpenProperty> {
    let name = attribute(e, b"name")?.ok_or_else(|| anyhow!("property without a name"))?;
    let value = match attribute(e, b"type")?.as_deref() {
        Some("array") => PrefValue::Array(Vec::new()),
        _ => PrefValue::Scalar(String::new()),
    };
    Ok(OpenProperty { name, value })
}

/// Array entries are named `[0]`, `[1]`, ...
fn array_index(e: &BytesStart) -> Result<usize> {
    let name = attribute(e, b"name")?.unwrap_or_default();
    name.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| anyhow!("bad array entry name '{}'", name))
}

fn append_text(depth: usize, open: &mut Option<OpenProperty>, item: &mut Option<(usize, String)>, text: &str) {
    match depth {
        3 => {
            if let Some((_, value)) = item.as_mut() {
                value.push_str(text);
            }
        }
        2 => {
            if let Some(OpenProperty { value: PrefValue::Scalar(value), .. }) = open.as_mut() {
                value.push_str(text);
            }
        }
        _ => {}
    }
}

// -------------------- Loading --------------------

/// Loads preferences from the first readable source, applying environment
/// overrides. Never fails: unreadable sources fall through to defaults.
pub fn load_preferences(settings: &StarterSettings, tracker_home: &Path, log: &mut StartLog) -> LaunchPreferences {
    let mut prefs = LaunchPreferences::default();
    let overrides = &settings.overrides;
    let mut loaded = false;

    if let Some(path) = &overrides.prefs_file {
        log.message(format!("system property PREFERRED_TRACKER_PREFS = {}", path.display()));
    }

    let mut document = None;
    for candidate in settings.prefs_candidates(tracker_home) {
        match PrefsDocument::read(&candidate) {
            Ok(doc) => {
                document = Some((candidate, doc));
                break;
            }
            Err(e) => log::debug!(target: "preferences", "{:#}", e),
        }
    }

    if let Some((path, _)) = &document {
        log.message(format!("loading starter preferences from: {}", path.display()));
        prefs.source = Some(path.clone());
    }
    let doc = document.as_ref().map(|(_, doc)| doc);

    // VM bitness
    if let Some(bitness) = &overrides.vm_bitness {
        log.message(format!("system property PREFERRED_VM_BITNESS = {}", bitness));
        prefs.use_32_bit = bitness.trim() == "32";
    } else if let Some(doc) = doc {
        prefs.use_32_bit = doc.get_bool("32-bit");
    }

    // Tracker jar
    let mut jar_name: Option<String> = None;
    if let Some(jar_path) = &overrides.tracker_jar {
        log.message(format!("system property PREFERRED_TRACKER_JAR = {}", jar_path.display()));
        loaded = true;
        prefs.jar_path_override = Some(jar_path.clone());
        jar_name = jar_path.file_name().map(|n| n.to_string_lossy().into_owned());
    } else if let Some(jar) = doc.and_then(|d| d.get_string("tracker_jar")) {
        loaded = true;
        jar_name = Some(jar.trim().to_string());
    }
    if let Some(jar) = jar_name.filter(|j| !j.eq_ignore_ascii_case(DEFAULT_JAR_NAME)) {
        match JarVersion::from_jar_name(&jar) {
            Some(version) => {
                log.message(format!("preferred version: {}", version.label));
                prefs.preferred_jar = Some(version);
            }
            None => log.message(format!("version number could not be parsed: {}", jar)),
        }
    }

    // Java VM
    let vm = match &overrides.java_vm {
        Some(vm) => {
            log.message(format!("system property PREFERRED_JAVA_VM = {}", vm));
            Some(vm.clone())
        }
        None => doc.and_then(|d| d.get_string("java_vm")).map(str::to_string),
    };
    if let Some(vm) = vm {
        loaded = true;
        match resolve_java_executable(&vm, settings.platform) {
            Some(java) => {
                log.message(format!("preferred java VM: {}", java.display()));
                prefs.java_vm = Some(java);
            }
            None => log.message("preferred java VM invalid--using default instead"),
        }
    }

    // Executables to run before launch
    if let Some(run) = doc.and_then(|d| d.get_strings("run")) {
        loaded = true;
        prefs.run = run.iter().filter(|s| !s.trim().is_empty()).cloned().collect();
    }

    // Memory size
    if let Some(size) = &overrides.memory_size {
        loaded = true;
        log.message(format!("system property PREFERRED_MEMORY_SIZE = {}", size));
        prefs.heap_mb = size.trim().parse().unwrap_or(0);
    } else if let Some(size) = doc.and_then(|d| d.get_int("memory_size")) {
        prefs.heap_mb = u32::try_from(size).unwrap_or(0);
    }
    if prefs.heap_mb > 0 {
        log.message(format!("preferred memory size: {} MB", prefs.heap_mb));
    }

    if loaded {
        return prefs;
    }
    if let Some((path, _)) = &document {
        log.message(format!("no starter preferences found in {}", path.display()));
    }

    // Fall back to the deprecated starter prefs file
    let Some(legacy_path) = settings
        .legacy_prefs_candidates(tracker_home)
        .into_iter()
        .find(|p| p.is_file())
    else {
        log.message("no starter preferences found");
        return prefs;
    };
    log.message(format!("loading starter preferences from {}", legacy_path.display()));
    match fs::read_to_string(&legacy_path) {
        Ok(text) => {
            apply_legacy_prefs(&text, &mut prefs, log);
            prefs.source = Some(legacy_path);
        }
        Err(e) => log.message(format!("unable to load preferences: {}", e)),
    }
    prefs
}

/// Applies `run`, `version` and `jre` directives from the deprecated format.
pub fn apply_legacy_prefs(text: &str, prefs: &mut LaunchPreferences, log: &mut StartLog) {
    for line in text.lines() {
        if let Some(app) = line.strip_prefix("run ") {
            let app = app.trim();
            if !app.is_empty() {
                prefs.run.push(app.to_string());
            }
        } else if let Some(ver) = line.strip_prefix("version ") {
            let ver = ver.trim();
            match jar_resolver::parse_version_number(ver) {
                Some(number) => {
                    log.message(format!("preferred version: {}", ver));
                    prefs.preferred_jar = Some(JarVersion {
                        number,
                        label: ver.to_string(),
                    });
                }
                None => log.message(format!("version number could not be parsed: {}", ver)),
            }
        } else if let Some(jre) = line.strip_prefix("jre ") {
            let java = PathBuf::from(jre.trim());
            log.message(format!("preferred java VM: {}", java.display()));
            if java.parent().is_some_and(|dir| dir.exists()) {
                prefs.java_vm = Some(java);
            } else {
                log.message("preferred java VM invalid--using default instead");
            }
        }
    }
}

/// Finds the `java` executable for a JRE/JDK directory or binary path.
pub fn resolve_java_executable(vm: &str, platform: Platform) -> Option<PathBuf> {
    let normalized = vm.trim().replace('\\', "/");
    let normalized = normalized.trim_end_matches('/');
    let exe = platform.java_binary_name();

    if normalized.ends_with("/bin/java") || normalized.ends_with("/bin/java.exe") {
        let path = PathBuf::from(vm.trim());
        return path.is_file().then_some(path);
    }

    let mut root = PathBuf::from(normalized);
    if normalized.ends_with("/lib/ext") {
        root = root.parent()?.parent()?.to_path_buf();
    } else if normalized.ends_with("/bin") {
        root = root.parent()?.to_path_buf();
    }

    [root.join("bin").join(exe), root.join("jre").join("bin").join(exe)]
        .into_iter()
        .find(|candidate| candidate.is_file())
}

/// Runs each pre-launch executable synchronously from the tracker home.
/// Failures are logged and ignored.
pub fn run_executables(run: &[String], tracker_home: &Path, log: &mut StartLog) {
    for app in run {
        let relative = tracker_home.join(app);
        let target = if relative.exists() {
            relative
        } else if Path::new(app).exists() {
            PathBuf::from(app)
        } else {
            log.message(format!("executable file not found: {}", app));
            continue;
        };
        log.message(format!("executing {}", target.display()));
        match Command::new(&target).current_dir(tracker_home).status() {
            Ok(status) if !status.success() => {
                log.message(format!("{} exited with {}", target.display(), status));
            }
            Ok(_) => {}
            Err(e) => log.message(format!("execution failed: {}", e)),
        }
    }
}
