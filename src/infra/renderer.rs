//! Vendor CLI renderer: turns a VI on disk into an HTML document.

use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{fs, process::Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ConversionError, RenderFailure};

/// Operation the vendor CLI runs against the driver document.
pub const OPERATION_NAME: &str = "RunVI";
pub const DEFAULT_CLI_PROGRAM: &str = "LabVIEWCLI";
pub const DEFAULT_CONTROL_PORT: u16 = 3363;
/// Returned when the renderer produced an empty document.
pub const PROCESSING_PLACEHOLDER: &str = r#"<div class="loading">Processing VI file...</div>"#;

/// Upper bound for `empty_output_retries`; every retry runs under the host-wide lock.
pub const MAX_EMPTY_OUTPUT_RETRIES: u32 = 10;

const EMPTY_OUTPUT_BACKOFF: Duration = Duration::from_millis(100);
const EMPTY_OUTPUT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Produces HTML for a VI that exists on the real filesystem.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, input: &Path) -> Result<String, ConversionError>;
}

#[derive(Debug, Clone)]
pub struct CliRendererConfig {
    pub cli_program: PathBuf,
    /// Application binary; `None` targets the instance already running on the host.
    pub application_path: Option<PathBuf>,
    pub control_port: u16,
    pub driver_path: PathBuf,
    pub output_dir: PathBuf,
    pub empty_output_retries: u32,
}

#[derive(Debug, Clone)]
pub struct CliRenderer {
    config: CliRendererConfig,
}

impl CliRenderer {
    pub fn new(config: CliRendererConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CliRendererConfig {
        &self.config
    }

    /// Arguments passed to the CLI, in order.
    pub fn arguments(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let port = self.config.control_port.to_string();
        let mut args: Vec<OsString> = vec!["-OperationName".into(), OPERATION_NAME.into()];
        if let Some(application) = self.config.application_path.as_ref() {
            args.push("-LabVIEWPath".into());
            args.push(application.as_os_str().to_owned());
        }
        args.push("-PortNumber".into());
        args.push(port.clone().into());
        args.push("-VIPath".into());
        args.push(self.config.driver_path.as_os_str().to_owned());
        args.push(input.as_os_str().to_owned());
        args.push(output.as_os_str().to_owned());
        // The driver reads the port again as its own positional argument.
        args.push(port.into());
        args
    }

    fn allocate_output(&self) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{}.html", Uuid::new_v4().simple()))
    }

    async fn read_artifact(&self, output: &Path) -> Result<String, RenderFailure> {
        let retries = self.config.empty_output_retries.min(MAX_EMPTY_OUTPUT_RETRIES);
        let mut attempt = 0;
        let mut backoff = EMPTY_OUTPUT_BACKOFF;
        loop {
            let bytes = fs::read(output)
                .await
                .map_err(|source| RenderFailure::MissingArtifact {
                    path: output.to_path_buf(),
                    source,
                })?;
            if !bytes.is_empty() || attempt >= retries {
                return Ok(decode_artifact(output, bytes));
            }
            attempt += 1;
            debug!(
                target = "infra::renderer",
                op = "renderer::read_artifact",
                result = "empty",
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                output = %output.display(),
                "Renderer output empty; retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn run(&self, input: &Path, output: &Path) -> Result<String, RenderFailure> {
        let cli_started_at = Instant::now();
        let program = self.config.cli_program.display().to_string();
        let result = Command::new(&self.config.cli_program)
            .args(self.arguments(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| {
                warn!(
                    target = "infra::renderer",
                    op = "renderer::render",
                    result = "error",
                    error_code = if source.kind() == ErrorKind::NotFound { "cli_not_found" } else { "spawn_cli" },
                    program = %program,
                    error = %source,
                    "Failed to spawn renderer CLI"
                );
                RenderFailure::Spawn {
                    program: program.clone(),
                    source,
                }
            })?;

        let cli_elapsed_ms = cli_started_at.elapsed().as_millis() as u64;
        metrics::histogram!("gpreview_render_ms").record(cli_elapsed_ms as f64);

        let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
        if !result.status.success() {
            let exit_code = result.status.code();
            warn!(
                target = "infra::renderer",
                op = "renderer::render",
                result = "error",
                cli_elapsed_ms,
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                error_code = "renderer_cli",
                stderr = %stderr,
                "Renderer CLI invocation failed"
            );
            return Err(RenderFailure::Exit { exit_code, stderr });
        }
        if !stderr.is_empty() {
            warn!(
                target = "infra::renderer",
                op = "renderer::render",
                result = "stderr",
                cli_elapsed_ms,
                stderr = %stderr,
                "Conversion warning"
            );
        }
        let stdout = String::from_utf8_lossy(&result.stdout);
        if !stdout.trim().is_empty() {
            debug!(
                target = "infra::renderer",
                op = "renderer::render",
                stdout = %stdout.trim(),
                "Renderer CLI output"
            );
        }

        self.read_artifact(output).await
    }
}

#[async_trait]
impl Renderer for CliRenderer {
    async fn render(&self, input: &Path) -> Result<String, ConversionError> {
        let started_at = Instant::now();
        let input = std::path::absolute(input).unwrap_or_else(|_| input.to_path_buf());
        let output = self.allocate_output();

        let rendered = self.run(&input, &output).await;

        let html = match rendered {
            Ok(html) => html,
            Err(cause) => {
                // Never leave a partial artifact behind.
                if let Err(err) = fs::remove_file(&output).await
                    && err.kind() != ErrorKind::NotFound
                {
                    warn!(
                        target = "infra::renderer",
                        op = "renderer::render",
                        output = %output.display(),
                        error = %err,
                        "Failed to remove renderer output after failure"
                    );
                }
                return Err(ConversionError::renderer(cause));
            }
        };

        remove_artifact(&output).await?;

        info!(
            target = "infra::renderer",
            op = "renderer::render",
            result = if html.is_empty() { "placeholder" } else { "rendered" },
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            input = %input.display(),
            html_bytes = html.len(),
            "VI rendered via CLI"
        );

        if html.is_empty() {
            Ok(PROCESSING_PLACEHOLDER.to_string())
        } else {
            Ok(html)
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(EMPTY_OUTPUT_MAX_BACKOFF)
}

/// The vendor CLI may emit code-page bytes in labels; keep the document and
/// substitute replacement characters.
fn decode_artifact(output: &Path, bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(html) => html,
        Err(err) => {
            warn!(
                target = "infra::renderer",
                op = "renderer::read_artifact",
                result = "lossy",
                output = %output.display(),
                valid_up_to = err.utf8_error().valid_up_to(),
                "Renderer output is not valid UTF-8; replacing invalid bytes"
            );
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
    }
}

/// Failing to delete a read artifact fails the conversion.
async fn remove_artifact(output: &Path) -> Result<(), ConversionError> {
    fs::remove_file(output)
        .await
        .map_err(|source| ConversionError::ArtifactCleanupFailed {
            path: output.to_path_buf(),
            source,
        })
}
