#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("AlreadyExists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: reconcile exceeded {0:?}")]
    Timeout(std::time::Duration),

    #[error("ValidationError: {0}")]
    ValidationError(String),

    #[error("InvariantViolation: {0}")]
    InvariantViolation(String),

    #[error("Finalizer Error: {0}")]
    FinalizerError(String),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Error::AlreadyExists(ae.message)
            }
            kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(ae.message),
            other => Error::KubeError(other),
        }
    }
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Errors that clear up without a spec change: API hiccups, throttling,
    /// optimistic-concurrency losses and deadline expiry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Conflict(_) | Error::AlreadyExists(_) | Error::Timeout(_) => true,
            Error::KubeError(_) | Error::NotFound(_) | Error::FinalizerError(_) => true,
            Error::SerializationError(_) => false,
            Error::ValidationError(_) | Error::InvariantViolation(_) => false,
        }
    }
}
