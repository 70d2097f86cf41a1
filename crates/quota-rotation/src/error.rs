//! Error kinds for rotation operations
//!
//! Only `Authentication` changes state during error handling: the retry
//! policy rotates to the next account. Everything else propagates as-is.

/// Errors from probing, rotating and selecting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credential rejected by the token endpoint
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Timeout, connection failure, 5xx or malformed response
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("no account available")]
    NoAccountAvailable,

    /// The backend reported nothing for the requested model
    #[error("no quota data for {0}")]
    NoQuotaData(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl Error {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Authentication(_) => "authentication",
            Error::Transient(_) => "transient",
            Error::NoAccountAvailable => "no_account",
            Error::NoQuotaData(_) => "no_quota_data",
            Error::Storage(_) => "storage",
        }
    }
}

impl From<cloudcode_auth::Error> for Error {
    fn from(e: cloudcode_auth::Error) -> Self {
        use cloudcode_auth::Error as Auth;
        match e {
            Auth::InvalidCredentials(msg) => Error::Authentication(msg),
            Auth::Io(msg) | Auth::CredentialParse(msg) => Error::Storage(msg),
            other @ (Auth::Http(_) | Auth::Timeout(_) | Auth::TokenExchange(_) | Auth::Upstream(_)) => {
                Error::Transient(other.to_string())
            }
        }
    }
}

/// Result alias for rotation operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_credentials_become_authentication() {
        let err: Error = cloudcode_auth::Error::InvalidCredentials("revoked".into()).into();
        assert!(matches!(err, Error::Authentication(ref m) if m == "revoked"));
        assert_eq!(err.kind(), "authentication");
    }

    #[test]
    fn network_failures_become_transient() {
        for source in [
            cloudcode_auth::Error::Http("reset".into()),
            cloudcode_auth::Error::Timeout("10s".into()),
            cloudcode_auth::Error::TokenExchange("503".into()),
            cloudcode_auth::Error::Upstream("500".into()),
        ] {
            let err: Error = source.into();
            assert_eq!(err.kind(), "transient", "got: {err}");
        }
    }

    #[test]
    fn file_failures_become_storage() {
        let err: Error = cloudcode_auth::Error::Io("disk full".into()).into();
        assert_eq!(err.kind(), "storage");
    }
}
