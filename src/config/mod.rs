//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::infra::{
    git::DEFAULT_GIT_PROGRAM,
    lock::default_lock_path,
    renderer::{DEFAULT_CLI_PROGRAM, DEFAULT_CONTROL_PORT, MAX_EMPTY_OUTPUT_RETRIES},
};

mod cli;

pub use cli::{CliArgs, Command, GlobalOverrides, RenderArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "gpreview";
const ENV_PREFIX: &str = "GPREVIEW";
const DEFAULT_DRIVER_RELATIVE: &str = "gpreview-labview/CLI.vi";
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 100;
pub(crate) const EMPTY_APPLICATION_PATH_LABEL: &str =
    "empty (uses last opened version of LabVIEW on Windows)";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub renderer: RendererSettings,
    pub lock: LockSettings,
    pub git: GitSettings,
    pub staging: StagingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub control_port: u16,
    /// `None` renders with whichever LabVIEW instance is already active.
    pub application_path: Option<PathBuf>,
    pub cli_program: PathBuf,
    pub driver_path: PathBuf,
    pub empty_output_retries: u32,
}

impl RendererSettings {
    /// Application path as shown to users.
    pub fn application_path_label(&self) -> String {
        match self.application_path.as_ref() {
            Some(path) => path.display().to_string(),
            None => EMPTY_APPLICATION_PATH_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub path: PathBuf,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct GitSettings {
    pub program: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StagingSettings {
    pub directory: PathBuf,
}

impl Settings {
    /// Settings built from built-in defaults only, ignoring files and environment.
    pub fn defaults() -> Result<Self, LoadError> {
        Self::from_raw(RawSettings::default())
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    renderer: RawRendererSettings,
    lock: RawLockSettings,
    git: RawGitSettings,
    staging: RawStagingSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(port) = overrides.renderer_port {
            self.renderer.control_port = Some(port);
        }
        if let Some(path) = overrides.renderer_application_path.as_ref() {
            self.renderer.application_path = Some(path.clone());
        }
        if let Some(cli) = overrides.renderer_cli.as_ref() {
            self.renderer.cli_program = Some(cli.clone());
        }
        if let Some(driver) = overrides.renderer_driver.as_ref() {
            self.renderer.driver_path = Some(driver.clone());
        }
        if let Some(timeout) = overrides.lock_timeout_ms {
            self.lock.timeout_ms = Some(timeout);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            renderer,
            lock,
            git,
            staging,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            renderer: build_renderer_settings(renderer)?,
            lock: build_lock_settings(lock)?,
            git: build_git_settings(git)?,
            staging: build_staging_settings(staging)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let control_port = renderer
        .control_port
        .unwrap_or(DEFAULT_CONTROL_PORT);
    if control_port == 0 {
        return Err(LoadError::invalid(
            "renderer.control_port",
            "port must be greater than zero",
        ));
    }

    let application_path = renderer.application_path.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    });

    let cli_program = renderer
        .cli_program
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CLI_PROGRAM));
    if cli_program.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.cli_program",
            "path must not be empty",
        ));
    }

    let driver_path = renderer.driver_path.unwrap_or_else(default_driver_path);
    if driver_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.driver_path",
            "path must not be empty",
        ));
    }

    let empty_output_retries = renderer.empty_output_retries.unwrap_or(0);
    if empty_output_retries > MAX_EMPTY_OUTPUT_RETRIES {
        return Err(LoadError::invalid(
            "renderer.empty_output_retries",
            format!("must be at most {MAX_EMPTY_OUTPUT_RETRIES}"),
        ));
    }

    Ok(RendererSettings {
        control_port,
        application_path,
        cli_program,
        driver_path,
        empty_output_retries,
    })
}

fn build_lock_settings(lock: RawLockSettings) -> Result<LockSettings, LoadError> {
    let path = lock.path.unwrap_or_else(default_lock_path);
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid("lock.path", "path must not be empty"));
    }

    let timeout_ms = lock.timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "lock.timeout_ms",
            "must be greater than zero",
        ));
    }

    let poll_ms = lock
        .poll_interval_ms
        .unwrap_or(DEFAULT_LOCK_POLL_INTERVAL_MS);
    if poll_ms == 0 {
        return Err(LoadError::invalid(
            "lock.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(LockSettings {
        path,
        timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(poll_ms),
    })
}

fn build_git_settings(git: RawGitSettings) -> Result<GitSettings, LoadError> {
    let program = git
        .program
        .unwrap_or_else(|| PathBuf::from(DEFAULT_GIT_PROGRAM));
    if program.as_os_str().is_empty() {
        return Err(LoadError::invalid("git.program", "path must not be empty"));
    }
    Ok(GitSettings { program })
}

fn build_staging_settings(staging: RawStagingSettings) -> Result<StagingSettings, LoadError> {
    let directory = staging.directory.unwrap_or_else(std::env::temp_dir);
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "staging.directory",
            "path must not be empty",
        ));
    }
    Ok(StagingSettings { directory })
}

/// Driver VI shipped next to the executable.
fn default_driver_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_DRIVER_RELATIVE)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DRIVER_RELATIVE))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    control_port: Option<u16>,
    application_path: Option<String>,
    cli_program: Option<PathBuf>,
    driver_path: Option<PathBuf>,
    empty_output_retries: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLockSettings {
    path: Option<PathBuf>,
    timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGitSettings {
    program: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStagingSettings {
    directory: Option<PathBuf>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
