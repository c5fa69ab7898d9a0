use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the gpreview binary.
#[derive(Debug, Parser)]
#[command(
    name = "gpreview",
    version,
    about = "Render LabVIEW VI files to HTML through the LabVIEW CLI"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "GPREVIEW_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Render a VI (or a historical revision of one) to HTML.
    Render(RenderArgs),
    /// Report whether the conversion lock is currently held.
    #[command(name = "lock-status")]
    LockStatus,
}

#[derive(Debug, Args, Clone, Default)]
pub struct RenderArgs {
    /// VI file to render.
    #[arg(
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        required_unless_present = "uri",
        conflicts_with = "uri"
    )]
    pub path: Option<PathBuf>,

    /// Editor document URI (`file:`, `git:`, `gitlens:` or a virtual scheme).
    #[arg(long, value_name = "URI")]
    pub uri: Option<String>,

    /// Render the file at this git revision; `~` selects the current head.
    #[arg(long, value_name = "REV", conflicts_with = "buffer")]
    pub revision: Option<String>,

    /// Read the document bytes from this file instead of PATH (e.g. unsaved edits).
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub buffer: Option<PathBuf>,

    /// Write the HTML here instead of stdout.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub out: Option<PathBuf>,

    /// On failure, emit the error page HTML and exit successfully.
    #[arg(long = "error-page", action = clap::ArgAction::SetTrue)]
    pub error_page: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the VI Server port used by the LabVIEW CLI.
    #[arg(long = "renderer-port", value_name = "PORT", global = true)]
    pub renderer_port: Option<u16>,

    /// Override the LabVIEW application path (empty uses the running instance).
    #[arg(long = "renderer-application-path", value_name = "PATH", global = true)]
    pub renderer_application_path: Option<String>,

    /// Override the LabVIEW CLI executable.
    #[arg(long = "renderer-cli", value_name = "PATH", global = true)]
    pub renderer_cli: Option<PathBuf>,

    /// Override the driver VI passed to the LabVIEW CLI.
    #[arg(long = "renderer-driver", value_name = "PATH", global = true)]
    pub renderer_driver: Option<PathBuf>,

    /// Override the conversion lock wait bound in milliseconds.
    #[arg(long = "lock-timeout-ms", value_name = "MILLIS", global = true)]
    pub lock_timeout_ms: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}
