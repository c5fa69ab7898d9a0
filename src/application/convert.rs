//! Serialized conversion of one document to HTML.

use std::{sync::Arc, time::Instant};

use tracing::{error, info, warn};

use crate::{
    application::materialize::{MaterializedFile, Materializer},
    domain::{ConversionError, FileReference},
    infra::{lock::ConversionLock, renderer::Renderer},
};

/// Rendered HTML plus any warning raised while preparing the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub html: String,
    pub warning: Option<&'static str>,
}

#[derive(Clone)]
pub struct ConversionPipeline {
    lock: Arc<dyn ConversionLock>,
    materializer: Materializer,
    renderer: Arc<dyn Renderer>,
}

impl ConversionPipeline {
    pub fn new(
        lock: Arc<dyn ConversionLock>,
        materializer: Materializer,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            lock,
            materializer,
            renderer,
        }
    }

    /// Convert `reference` under the host-wide lock.
    ///
    /// The lock is released and the materialized input removed on every path
    /// after acquisition, in that order. Neither step can replace the error
    /// returned by materialization or rendering.
    pub async fn convert(&self, reference: &FileReference) -> Result<Conversion, ConversionError> {
        let started_at = Instant::now();
        let display_path = reference.display_path();

        let lease = match self.lock.acquire().await {
            Ok(lease) => lease,
            Err(err) => {
                record_outcome(err.kind());
                error!(
                    target = "application::convert",
                    op = "convert",
                    result = "error",
                    path = %display_path,
                    error = %err,
                    "Conversion lock unavailable"
                );
                return Err(err);
            }
        };
        metrics::histogram!("gpreview_lock_wait_ms").record(lease.waited().as_millis() as f64);

        let attempt = match self.materializer.materialize(reference).await {
            Ok(file) => {
                let rendered = self.renderer.render(file.path()).await;
                Ok((file, rendered))
            }
            Err(err) => Err(err),
        };

        if let Err(err) = self.lock.release(lease).await {
            warn!(
                target = "application::convert",
                op = "convert::release",
                result = "error",
                error = %err,
                "Failed to release conversion lock"
            );
        }

        let rendered = attempt.and_then(|(file, rendered)| {
            let warning = file.warning();
            cleanup(file);
            rendered.map(|html| Conversion { html, warning })
        });

        match rendered {
            Ok(conversion) => {
                record_outcome("ok");
                info!(
                    target = "application::convert",
                    op = "convert",
                    result = "ok",
                    path = %display_path,
                    scheme = reference.scheme(),
                    html_bytes = conversion.html.len(),
                    staged = conversion.warning.is_some(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "VI converted"
                );
                Ok(conversion)
            }
            Err(err) => {
                record_outcome(err.kind());
                error!(
                    target = "application::convert",
                    op = "convert",
                    result = "error",
                    path = %display_path,
                    scheme = reference.scheme(),
                    kind = err.kind(),
                    error = %err,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Error converting VI file"
                );
                Err(err)
            }
        }
    }
}

fn cleanup(file: MaterializedFile) {
    if !file.is_temporary() {
        return;
    }
    let path = file.path().display().to_string();
    if let Err(err) = file.cleanup() {
        warn!(
            target = "application::convert",
            op = "convert::cleanup",
            result = "error",
            path = %path,
            error = %err,
            "Failed to remove materialized VI"
        );
    }
}

fn record_outcome(result: &'static str) {
    metrics::counter!("gpreview_conversions_total", "result" => result).increment(1);
}
