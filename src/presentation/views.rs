use askama::{Error as AskamaError, Template};
use thiserror::Error;
use tracing::error;

const ERROR_HEADING: &str = "Error Loading VI File";
/// Served when the error page itself cannot be rendered.
const FALLBACK_ERROR_HTML: &str = "<!DOCTYPE html><html><body><h3>Error Loading VI File</h3></body></html>";

#[derive(Debug, Error)]
#[error("{public_message}")]
pub struct TemplateRenderError {
    pub(crate) source: &'static str,
    pub(crate) public_message: &'static str,
    #[source]
    pub(crate) error: AskamaError,
}

impl TemplateRenderError {
    pub fn new(source: &'static str, public_message: &'static str, error: AskamaError) -> Self {
        Self {
            source,
            public_message,
            error,
        }
    }
}

pub fn render_template<T: Template>(template: T) -> Result<String, TemplateRenderError> {
    template.render().map_err(|err| {
        TemplateRenderError::new(
            "presentation::views::render_template",
            "Template rendering failed",
            err,
        )
    })
}

/// One configuration value shown on the error page.
#[derive(Clone, Debug)]
pub struct SettingView {
    pub name: &'static str,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct ErrorPageView {
    pub heading: &'static str,
    pub message: String,
    pub settings: Vec<SettingView>,
}

impl ErrorPageView {
    pub fn conversion_failed(message: impl Into<String>, settings: Vec<SettingView>) -> Self {
        Self {
            heading: ERROR_HEADING,
            message: message.into(),
            settings,
        }
    }
}

#[derive(Template)]
#[template(path = "error.html")]
pub struct ErrorTemplate {
    pub view: ErrorPageView,
}

/// Render the error surface; never fails.
pub fn render_error_page(view: ErrorPageView) -> String {
    match render_template(ErrorTemplate { view }) {
        Ok(html) => html,
        Err(err) => {
            error!(
                target = "presentation::views",
                op = "views::render_error_page",
                source_op = err.source,
                error = %err.error,
                "Failed to render error page"
            );
            FALLBACK_ERROR_HTML.to_string()
        }
    }
}
