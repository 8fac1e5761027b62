//! Error types for upstream HTTP and inbox operations

/// Errors from upstream HTTP calls and the token inbox.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request never produced a response (DNS, connect, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Upstream answered with a non-success status
    #[error("upstream returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether retrying later could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Error::Parse(_) | Error::Io(_) => false,
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Http("timed out".into()).is_transient());
        assert!(
            Error::Api {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            Error::Api {
                status: 429,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !Error::Api {
                status: 403,
                body: "Authentication error".into()
            }
            .is_transient()
        );
        assert!(!Error::Parse("missing result".into()).is_transient());
    }

    #[test]
    fn api_error_display_includes_status_and_body() {
        let err = Error::Api {
            status: 404,
            body: "namespace not found".into(),
        };
        assert_eq!(err.to_string(), "upstream returned 404: namespace not found");
    }
}
