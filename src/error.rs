use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced from the proxy core
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid backend url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unknown load balancing policy '{0}'")]
    UnknownPolicy(String),

    #[error("backend not found: {0}")]
    BackendNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("location not found: {0}")]
    LocationNotFound(String),

    #[error("location parameter is required for services with multiple locations")]
    AmbiguousLocation,

    #[error("no route for host '{0}'")]
    NoRoute(String),

    #[error("no eligible backend")]
    NoBackend,

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("malformed upstream response: {0}")]
    UpstreamProtocol(String),
}

impl ProxyError {
    /// Status code presented to the client. Internal detail stays in the
    /// log, keyed by the request correlation id.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute(_) | ProxyError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::NoBackend | ProxyError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::NoRoute("x.test".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ProxyError::NoBackend.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ProxyError::UpstreamProtocol("truncated body".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
