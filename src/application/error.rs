use thiserror::Error;

use crate::{
    application::preview::PreviewError, config::LoadError, domain::ReferenceError,
    infra::error::InfraError,
};

/// Failure of a `gpreview` command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Preview(#[from] PreviewError),
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(error))
    }
}
