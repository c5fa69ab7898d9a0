//! Render boundary used by the preview host: HTML or a displayable error.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    application::{
        convert::{Conversion, ConversionPipeline},
        materialize::Materializer,
    },
    config::{RendererSettings, Settings},
    domain::{ConversionError, FileReference},
    infra::{
        git::GitCli,
        lock::FileConversionLock,
        renderer::{CliRenderer, CliRendererConfig},
    },
    presentation::views::{ErrorPageView, SettingView, render_error_page},
};

/// Successful preview of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub html: String,
    pub warning: Option<&'static str>,
}

impl From<Conversion> for Preview {
    fn from(conversion: Conversion) -> Self {
        Self {
            html: conversion.html,
            warning: conversion.warning,
        }
    }
}

/// Failed preview, carrying the settings that were in effect.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PreviewError {
    pub message: String,
    pub kind: &'static str,
    pub control_port: u16,
    pub application_path: String,
}

impl PreviewError {
    fn from_conversion(err: &ConversionError, renderer: &RendererSettings) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind(),
            control_port: renderer.control_port,
            application_path: renderer.application_path_label(),
        }
    }

    pub fn settings(&self) -> Vec<SettingView> {
        vec![
            SettingView {
                name: "viServerPort",
                value: self.control_port.to_string(),
            },
            SettingView {
                name: "labViewFilePath",
                value: self.application_path.clone(),
            },
        ]
    }

    /// Error surface shown in place of the preview.
    pub fn to_html(&self) -> String {
        render_error_page(ErrorPageView::conversion_failed(
            self.message.clone(),
            self.settings(),
        ))
    }
}

#[derive(Clone)]
pub struct PreviewService {
    pipeline: ConversionPipeline,
    renderer: RendererSettings,
}

impl PreviewService {
    pub fn new(pipeline: ConversionPipeline, renderer: RendererSettings) -> Self {
        Self { pipeline, renderer }
    }

    /// Wire the file lock, git and the LabVIEW CLI from resolved settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let lock = FileConversionLock::new(
            settings.lock.path.clone(),
            settings.lock.timeout,
            settings.lock.poll_interval,
        );
        let git = GitCli::new(settings.git.program.clone());
        let renderer = CliRenderer::new(CliRendererConfig {
            cli_program: settings.renderer.cli_program.clone(),
            application_path: settings.renderer.application_path.clone(),
            control_port: settings.renderer.control_port,
            driver_path: settings.renderer.driver_path.clone(),
            output_dir: settings.staging.directory.clone(),
            empty_output_retries: settings.renderer.empty_output_retries,
        });
        let materializer = Materializer::new(settings.staging.directory.clone(), Arc::new(git));
        let pipeline = ConversionPipeline::new(Arc::new(lock), materializer, Arc::new(renderer));
        Self::new(pipeline, settings.renderer.clone())
    }

    pub async fn render(&self, reference: &FileReference) -> Result<Preview, PreviewError> {
        self.pipeline
            .convert(reference)
            .await
            .map(Preview::from)
            .map_err(|err| PreviewError::from_conversion(&err, &self.renderer))
    }

    /// Always produces HTML: the preview, or the error surface.
    pub async fn render_or_error_page(&self, reference: &FileReference) -> String {
        match self.render(reference).await {
            Ok(preview) => preview.html,
            Err(err) => err.to_html(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::EMPTY_APPLICATION_PATH_LABEL;

    fn renderer_settings(application_path: Option<PathBuf>) -> RendererSettings {
        RendererSettings {
            control_port: 3363,
            application_path,
            cli_program: PathBuf::from("LabVIEWCLI"),
            driver_path: PathBuf::from("CLI.vi"),
            empty_output_retries: 0,
        }
    }

    #[test]
    fn error_carries_effective_settings() {
        let err = PreviewError::from_conversion(
            &ConversionError::revision_missing("/repo/Main.vi"),
            &renderer_settings(None),
        );

        assert_eq!(err.kind, "revision_missing");
        assert_eq!(err.control_port, 3363);
        assert_eq!(err.application_path, EMPTY_APPLICATION_PATH_LABEL);

        let html = err.to_html();
        assert!(html.contains("/repo/Main.vi"));
        assert!(html.contains("viServerPort: 3363"));
        assert!(html.contains(EMPTY_APPLICATION_PATH_LABEL));
    }

    #[test]
    fn configured_application_path_is_shown() {
        let err = PreviewError::from_conversion(
            &ConversionError::lock_timeout("/tmp/x.lock", std::time::Duration::from_secs(60)),
            &renderer_settings(Some(PathBuf::from("/opt/labview/labview64"))),
        );
        assert!(err.to_html().contains("labViewFilePath: /opt/labview/labview64"));
    }
}
