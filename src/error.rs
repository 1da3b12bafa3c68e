use thiserror::Error;

pub type ForecastResult<T> = Result<T, ForecastError>;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("invalid horizon '{0}', expected '30d' or '60d'")]
    InvalidHorizon(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("{0}")]
    NotFound(String),

    #[error("game catalog integration is not configured")]
    CatalogUnavailable,

    #[error("upcoming games data not generated yet")]
    UpcomingUnavailable,

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ForecastError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ForecastError::InvalidHorizon(_) | ForecastError::BadRequest(_) => 400,
            ForecastError::NotFound(_) => 404,
            ForecastError::Upstream(_) => 502,
            ForecastError::ModelNotLoaded(_)
            | ForecastError::CatalogUnavailable
            | ForecastError::UpcomingUnavailable => 503,
            ForecastError::Internal(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Message safe to hand to a caller. Internal faults are logged with full
    /// context and reported generically.
    pub fn public_message(&self) -> String {
        match self {
            ForecastError::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "internal_error");
                "An unexpected error occurred".to_string()
            }
            ForecastError::Upstream(msg) => {
                tracing::error!(error = %msg, "upstream_error");
                "External service error".to_string()
            }
            other => other.to_string(),
        }
    }
}
