//! Error taxonomy, plain-text responses and the HTML placeholder pages

use crate::module::ModuleState;
use crate::router::{full_body, HubResponse};
use hyper::{Response, StatusCode};
use std::path::Path;
use tracing::debug;

/// Errors surfaced by the handshake and command handlers
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Error reading Request")]
    InvalidRequest(String),

    #[error("Empty Hash : Try to start module")]
    EmptyHash,

    #[error("Error module not found")]
    ModuleNotFound(String),

    #[error("Error : Command not found")]
    CommandNotFound(String),

    #[error("Error : Unauthorized")]
    Unauthorized(String),

    #[error("Error : module {name} unreachable : {reason}")]
    ModuleUnreachable { name: String, reason: String },

    #[error("Error : module {0} did not confirm shutdown")]
    ShutdownNotConfirmed(String),

    #[error("Error : module {0} already online")]
    AlreadyOnline(String),

    #[error("Error : module {0} already registered")]
    DuplicateModule(String),

    #[error("Error : setup failed : {0}")]
    Setup(String),

    #[error("Error : {0}")]
    Io(#[from] std::io::Error),

    #[error("Error : {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::InvalidRequest(_) | HubError::EmptyHash => StatusCode::BAD_REQUEST,
            HubError::ModuleNotFound(_) | HubError::CommandNotFound(_) => StatusCode::NOT_FOUND,
            HubError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HubError::ModuleUnreachable { .. } | HubError::ShutdownNotConfirmed(_) => {
                StatusCode::BAD_GATEWAY
            }
            HubError::AlreadyOnline(_) | HubError::DuplicateModule(_) => StatusCode::CONFLICT,
            HubError::Setup(_) | HubError::Io(_) | HubError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn unreachable(name: &str, reason: impl ToString) -> Self {
        HubError::ModuleUnreachable {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Plain-text response with a trailing newline
pub fn text_response(status: StatusCode, body: impl Into<String>) -> HubResponse {
    let mut body = body.into();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

pub fn error_response(err: &HubError) -> HubResponse {
    text_response(err.status_code(), err.to_string())
}

const DEFAULT_LOADING_TEMPLATE: &str = include_str!("../resources/html/loading.html");
const DEFAULT_NOT_FOUND_TEMPLATE: &str = include_str!("../resources/html/404.html");

/// Values substituted into a page template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPage {
    pub title: String,
    pub code: StatusCode,
    pub message: String,
}

impl ErrorPage {
    pub fn new(title: &str, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            code,
            message: message.into(),
        }
    }

    /// Placeholder for a module that is missing or not `Online`
    pub fn for_state(state: Option<ModuleState>) -> Self {
        match state {
            Some(ModuleState::Loading) | Some(ModuleState::Downloaded) => Self::new(
                "Loading",
                StatusCode::SERVICE_UNAVAILABLE,
                "Module is loading ...",
            ),
            Some(ModuleState::Stopped) => Self::new(
                "Stopped",
                StatusCode::GONE,
                "Module stopped by an administrator",
            ),
            _ => Self::new("Error", StatusCode::INTERNAL_SERVER_ERROR, "Error"),
        }
    }
}

/// Renders placeholder and not-found pages from `loading.html` and `404.html`
#[derive(Debug, Clone)]
pub struct PageRenderer {
    loading: String,
    not_found: String,
}

impl Default for PageRenderer {
    fn default() -> Self {
        Self {
            loading: DEFAULT_LOADING_TEMPLATE.to_string(),
            not_found: DEFAULT_NOT_FOUND_TEMPLATE.to_string(),
        }
    }
}

impl PageRenderer {
    /// Templates from `<resource_dir>/html/`, built-in defaults for missing files
    pub fn from_resource_dir(resource_dir: &Path) -> Self {
        let html = resource_dir.join("html");
        let read = |file: &str, fallback: &str| match std::fs::read_to_string(html.join(file)) {
            Ok(template) => template,
            Err(_) => {
                debug!(file, dir = %html.display(), "Template not found, using built-in page");
                fallback.to_string()
            }
        };

        Self {
            loading: read("loading.html", DEFAULT_LOADING_TEMPLATE),
            not_found: read("404.html", DEFAULT_NOT_FOUND_TEMPLATE),
        }
    }

    pub fn render(&self, page: &ErrorPage) -> HubResponse {
        html_response(page.code, render_template(&self.loading, page))
    }

    pub fn placeholder(&self, state: Option<ModuleState>) -> HubResponse {
        self.render(&ErrorPage::for_state(state))
    }

    pub fn not_found(&self) -> HubResponse {
        let page = ErrorPage::new("Not Found", StatusCode::NOT_FOUND, "Page not found");
        html_response(page.code, render_template(&self.not_found, &page))
    }
}

fn html_response(status: StatusCode, body: String) -> HubResponse {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

fn render_template(template: &str, page: &ErrorPage) -> String {
    template
        .replace("{{title}}", &escape_html(&page.title))
        .replace("{{code}}", page.code.as_str())
        .replace("{{message}}", &escape_html(&page.message))
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
