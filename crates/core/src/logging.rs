//! Logging plans and crash artifacts.
//!
//! This module decides *what* to install (filter strings, the rolling file
//! sink, the panic hook); the binary wires the plans into a
//! `tracing_subscriber` registry.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "visionnova";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    /// Filter chosen from CLI, verbosity, `RUST_LOG` or the default.
    pub user_filter: String,
    /// `user_filter`, prefixed with the noise filter when the choice was implicit.
    pub effective_filter: String,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
struct PanicArtifactRecord {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    source_location: String,
    payload: String,
    backtrace_policy: String,
    backtrace_text: String,
}

pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;

    let effective_filter = if implicit && !options.noise_filter.trim().is_empty() {
        format!("{},{user_filter}", options.noise_filter)
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        effective_filter,
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the default.
fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        return filter.to_string();
    }
    match options.verbose {
        0 => options
            .rust_log_env
            .clone()
            .unwrap_or_else(|| options.default_log_filter.clone()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Install a process-wide panic hook that writes one artifact per panic
/// under `<data_dir>/logs/crash`, then chains to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        write_panic_artifact_with_fallback(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

fn write_panic_artifact_with_fallback(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the artifact must not recurse into the hook.
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_panic_artifact_file(crash_dir, &build_panic_artifact_record(info))
    }));

    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn build_panic_artifact_record(info: &PanicHookInfo<'_>) -> PanicArtifactRecord {
    let (backtrace_policy, backtrace_text) = capture_backtrace_details();
    let source_location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "<unknown>".to_string());

    PanicArtifactRecord {
        timestamp: chrono::Utc::now(),
        thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
        source_location,
        payload: panic_payload_to_string(info.payload()),
        backtrace_policy,
        backtrace_text,
    }
}

fn capture_backtrace_details() -> (String, String) {
    let backtrace = Backtrace::capture();
    let (policy, text) = match backtrace.status() {
        BacktraceStatus::Captured => ("captured", backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1/full to enable)",
            "<disabled by backtrace policy>".to_string(),
        ),
        BacktraceStatus::Unsupported => (
            "unsupported",
            "<backtrace unsupported on this platform>".to_string(),
        ),
        _ => ("unknown", "<backtrace status unknown>".to_string()),
    };
    (policy.to_string(), text)
}

fn write_panic_artifact_file(
    crash_dir: &Path,
    report: &PanicArtifactRecord,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let artifact_path = crash_dir.join(format!(
        "panic-{}-{sequence:06}.log",
        report.timestamp.format("%Y%m%d-%H%M%S-%f")
    ));

    let mut file = fs::File::create(&artifact_path)?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "location={}", report.source_location)?;
    writeln!(file, "payload={}", report.payload)?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", report.backtrace_text)?;
    file.flush()?;

    Ok(artifact_path)
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn record(payload: &str) -> PanicArtifactRecord {
        PanicArtifactRecord {
            timestamp: chrono::Utc::now(),
            thread_name: "worker-3".to_string(),
            source_location: "src/tiling.rs:40:9".to_string(),
            payload: payload.to_string(),
            backtrace_policy: "captured".to_string(),
            backtrace_text: "fake backtrace".to_string(),
        }
    }

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("visionnova_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "visionnova_core=trace");
        assert_eq!(filters.effective_filter, "visionnova_core=trace");
    }

    #[test]
    fn verbosity_beats_rust_log() {
        let debug = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LoggingInitOptions {
            verbose: 2,
            ..debug.clone()
        };

        assert_eq!(compose_logging_filters(&debug).effective_filter, "debug");
        assert_eq!(compose_logging_filters(&trace).effective_filter, "trace");
    }

    #[test]
    fn rust_log_used_with_noise_prefix_when_implicit() {
        let options = LoggingInitOptions {
            rust_log_env: Some("warn,visionnova_core=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "warn,visionnova_core=debug");
        assert_eq!(
            filters.effective_filter,
            "ort=error,warn,visionnova_core=debug"
        );
    }

    #[test]
    fn default_filter_is_info_with_noise() {
        let filters = compose_logging_filters(&LoggingInitOptions::default());
        assert_eq!(filters.user_filter, "info");
        assert_eq!(filters.effective_filter, "ort=error,info");
    }

    #[test]
    fn empty_noise_filter_is_skipped() {
        let options = LoggingInitOptions {
            noise_filter: "  ".to_string(),
            ..Default::default()
        };
        assert_eq!(compose_logging_filters(&options).effective_filter, "info");
    }

    #[test]
    fn file_sink_uses_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingInitOptions {
            data_dir: Some(data_dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        match build_file_sink_plan(&options) {
            FileSinkPlan::Ready {
                log_dir,
                retention_files,
                ..
            } => {
                assert_eq!(log_dir, data_dir.path().join(DEFAULT_LOG_DIR_NAME));
                assert_eq!(retention_files, DEFAULT_LOG_RETENTION_FILES);
                assert!(log_dir.is_dir());
            }
            FileSinkPlan::Fallback { reason, .. } => {
                panic!("expected ready file sink, got fallback: {reason}")
            }
        }
    }

    #[test]
    fn file_sink_without_data_dir_falls_back() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());
        assert!(plan.fallback_reason().unwrap().contains("not configured"));
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_cannot_be_created() {
        let not_a_dir = NamedTempFile::new().expect("named temp file");
        let options = LoggingInitOptions {
            data_dir: Some(not_a_dir.path().to_path_buf()),
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        assert!(!plan.is_ready());
        assert_eq!(
            plan.log_dir(),
            Some(not_a_dir.path().join(DEFAULT_LOG_DIR_NAME).as_path())
        );
        assert!(plan
            .fallback_reason()
            .unwrap()
            .contains("failed to create log directory"));
    }

    #[test]
    fn panic_artifact_file_contains_required_sections() {
        let crash_dir = tempdir().expect("tempdir");
        let path = write_panic_artifact_file(crash_dir.path(), &record("tile count drifted"))
            .expect("write artifact");
        let contents = fs::read_to_string(&path).expect("read artifact");

        assert!(path.starts_with(crash_dir.path()));
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("log"));
        for expected in [
            "timestamp_utc=",
            "thread=worker-3",
            "location=src/tiling.rs:40:9",
            "payload=tile count drifted",
            "backtrace_policy=captured",
            "backtrace:",
            "fake backtrace",
        ] {
            assert!(contents.contains(expected), "missing {expected:?}");
        }
    }

    #[test]
    fn consecutive_artifacts_get_distinct_names() {
        let crash_dir = tempdir().expect("tempdir");
        let first = write_panic_artifact_file(crash_dir.path(), &record("a")).unwrap();
        let second = write_panic_artifact_file(crash_dir.path(), &record("b")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn panic_artifact_errors_when_directory_creation_fails() {
        let not_a_dir = NamedTempFile::new().expect("temp file");
        let crash_dir = not_a_dir.path().join("crash");
        assert!(write_panic_artifact_file(&crash_dir, &record("x")).is_err());
    }

    #[test]
    fn panic_payload_to_string_handles_common_payload_types() {
        let str_payload: &(dyn Any + Send) = &"boom";
        let string_payload: &(dyn Any + Send) = &"kaboom".to_string();
        let int_payload: &(dyn Any + Send) = &123_u32;

        assert_eq!(panic_payload_to_string(str_payload), "boom");
        assert_eq!(panic_payload_to_string(string_payload), "kaboom");
        assert_eq!(
            panic_payload_to_string(int_payload),
            "<non-string panic payload>"
        );
    }
}
