#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Config(BatchError),
    Persistence(PersistenceError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "server io error: {err}"),
            Self::Config(err) => write!(f, "invalid engine config: {err}"),
            Self::Persistence(err) => write!(f, "failed to open result store: {err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<BatchError> for ServerError {
    fn from(value: BatchError) -> Self {
        Self::Config(value)
    }
}

impl From<PersistenceError> for ServerError {
    fn from(value: PersistenceError) -> Self {
        Self::Persistence(value)
    }
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn batch_not_found(batch_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::BatchNotFound,
                "batch_id is neither running nor stored",
                Some(format!("batch_id={batch_id}")),
            ),
        }
    }

    fn timeline_not_found(batch_id: &str, index: usize) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::TimelineNotFound,
                "batch has no completed timeline at this index",
                Some(format!("batch_id={batch_id} index={index}")),
            ),
        }
    }

    fn invalid_request(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new(ErrorCode::InvalidRequest, message, details),
        }
    }

    fn invalid_profile(err: ProfileError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new(
                ErrorCode::InvalidProfile,
                "profile failed validation",
                Some(err.to_string()),
            ),
        }
    }

    fn state_conflict(message: impl Into<String>, batch_id: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error: ApiError::new(
                ErrorCode::BatchStateConflict,
                message,
                Some(format!("batch_id={batch_id}")),
            ),
        }
    }

    fn batch_failed(batch_id: &str, reason: Option<String>) -> Self {
        let details = match reason {
            Some(reason) => format!("batch_id={batch_id} reason={reason}"),
            None => format!("batch_id={batch_id}"),
        };
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            error: ApiError::new(
                ErrorCode::BatchFailed,
                "batch failed and produced no result",
                Some(details),
            ),
        }
    }

    fn internal(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: ApiError::new(ErrorCode::InternalError, message, details),
        }
    }

    fn from_persistence(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotAttached => {
                Self::internal("result store is not attached", None)
            }
            other => Self::internal("persistence operation failed", Some(other.to_string())),
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}
