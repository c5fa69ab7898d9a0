use std::{path::Path, process};

use bytes::Bytes;
use gpreview::{
    application::{error::AppError, preview::PreviewService},
    config::{self, RenderArgs, Settings},
    domain::{FileReference, Revision},
    infra::{lock, telemetry},
};
use tokio::io::AsyncWriteExt;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::LockStatus => run_lock_status(settings).await,
    }
}

async fn run_render(settings: Settings, args: RenderArgs) -> Result<(), AppError> {
    let reference = build_reference(&args).await?;
    let service = PreviewService::from_settings(&settings);

    info!(
        target = "gpreview::render",
        path = %reference.display_path(),
        scheme = reference.scheme(),
        "Starting render"
    );

    let html = match service.render(&reference).await {
        Ok(preview) => {
            if let Some(warning) = preview.warning {
                eprintln!("warning: {warning}");
            }
            preview.html
        }
        Err(err) if args.error_page => {
            warn!(
                target = "gpreview::render",
                kind = err.kind,
                error = %err,
                "Render failed; emitting error page"
            );
            err.to_html()
        }
        Err(err) => return Err(err.into()),
    };

    write_output(args.out.as_deref(), &html).await
}

async fn build_reference(args: &RenderArgs) -> Result<FileReference, AppError> {
    let buffer = match args.buffer.as_ref() {
        Some(path) => Some(Bytes::from(tokio::fs::read(path).await?)),
        None => None,
    };

    if let Some(uri) = args.uri.as_deref() {
        return Ok(FileReference::from_uri(uri, buffer)?);
    }

    // clap guarantees PATH when no URI is given.
    let path = args.path.clone().unwrap_or_default();
    let reference = match (args.revision.as_deref(), buffer) {
        (Some(revision), _) => FileReference::historical(path, Revision::parse(revision)),
        (None, Some(bytes)) => FileReference::local_with_buffer(path, bytes),
        (None, None) => FileReference::local(path),
    };
    Ok(reference)
}

async fn write_output(out: Option<&Path>, html: &str) -> Result<(), AppError> {
    match out {
        Some(path) => tokio::fs::write(path, html).await?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(html.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

async fn run_lock_status(settings: Settings) -> Result<(), AppError> {
    let marker = settings.lock.path;
    let held = tokio::fs::try_exists(&marker).await?;
    let line = match (held, lock::read_holder(&marker).await) {
        (false, _) => format!("free: {}", marker.display()),
        (true, Some(pid)) => format!("held by pid {pid}: {}", marker.display()),
        (true, None) => format!("held by unknown holder: {}", marker.display()),
    };
    println!("{line}");
    Ok(())
}
