use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

const DEBUG_HINT: &str = "Use /debug?url=<link> para investigar.";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("upstream fetch of {url} failed: {detail}")]
    UpstreamFetch {
        url: String,
        status: Option<u16>,
        detail: String,
    },
    #[error("no media url found for {0}")]
    MediaNotFound(String),
    #[error("yt-dlp produced no locatable file for {0}")]
    OutputNotFound(String),
    #[error("yt-dlp failed: {0}")]
    ToolExecution(String),
    #[error("yt-dlp exceeded {0}s")]
    ToolTimeout(u64),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn upstream_status(url: &str, status: u16) -> Self {
        Self::UpstreamFetch {
            url: url.to_string(),
            status: Some(status),
            detail: format!("status {status}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub hint: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("INVALID_INPUT"),
            hint: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            hint: None,
        }
    }

    fn with_debug_hint(mut self) -> Self {
        self.hint = Some(DEBUG_HINT);
        self
    }
}

impl From<AppError> for ApiError {
    fn from(error: AppError) -> Self {
        match error {
            AppError::InvalidInput(message) => Self::bad_request(message),
            AppError::UpstreamFetch { status, .. } => {
                let status = status
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .filter(|code| code.is_client_error() || code.is_server_error())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Self {
                    status,
                    message: format!("Falha ao abrir a página de origem ({}).", status.as_u16()),
                    code: Some("UPSTREAM_FETCH_FAILED"),
                    hint: None,
                }
                .with_debug_hint()
            }
            AppError::MediaNotFound(_) => Self {
                status: StatusCode::NOT_FOUND,
                message: "Não encontrei o vídeo (post privado, sem metatags de mídia, ou layout mudou)."
                    .to_string(),
                code: Some("MEDIA_NOT_FOUND"),
                hint: None,
            }
            .with_debug_hint(),
            AppError::OutputNotFound(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Falha ao baixar/mesclar vídeo (arquivo não encontrado).".to_string(),
                code: Some("OUTPUT_NOT_FOUND"),
                hint: None,
            },
            AppError::ToolExecution(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Erro ao processar o vídeo.".to_string(),
                code: Some("TOOL_FAILED"),
                hint: None,
            },
            AppError::ToolTimeout(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "O download excedeu o tempo limite.".to_string(),
                code: Some("TOOL_TIMEOUT"),
                hint: None,
            },
            AppError::Config(_) => Self::internal("Erro interno do servidor."),
            AppError::Io(_) => Self::internal("Erro ao ler arquivo."),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            hint: self.hint,
        });

        (self.status, body).into_response()
    }
}
