use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use color_eyre::Report;

pub(crate) struct Error {
    inner: color_eyre::Report,
}

impl Error {
    pub(crate) fn kind(&self) -> Option<&ServiceError> {
        self.inner.downcast_ref()
    }

    pub(crate) fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        self.inner.root_cause()
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.inner, f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl<T> From<T> for Error
where
    ServiceError: From<T>,
{
    fn from(error: T) -> Self {
        Error {
            inner: Report::from(ServiceError::from(error)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ServiceError {
    #[error("Error in DB")]
    Repo(#[from] crate::repo::RepoError),

    #[error("Error in store")]
    Store(#[from] crate::store::StoreError),

    #[error("Error running probe")]
    Probe(#[from] crate::probe::ProbeError),

    #[error("Origin code must be at least 3 ascii characters")]
    InvalidOrigin,

    #[error("Operations state disappeared between create and read")]
    MissingState,

    #[error("Aggregation queue is empty")]
    QueueEmpty,

    #[error("Aggregation pipeline is not running")]
    PipelineClosed,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self.kind() {
            Some(ServiceError::InvalidOrigin) => StatusCode::BAD_REQUEST,
            Some(ServiceError::Probe(crate::probe::ProbeError::NotFound)) => {
                StatusCode::NOT_FOUND
            }
            Some(ServiceError::PipelineClosed) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("application/json")
            .body(
                serde_json::to_string(&serde_json::json!({
                    "msg": self.root_cause().to_string()
                }))
                .unwrap_or_else(|_| r#"{"msg":"Request failed"}"#.to_string()),
            )
    }
}
