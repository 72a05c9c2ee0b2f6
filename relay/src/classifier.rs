//! Maps faults to retryable or terminal.
//!
//! Transport trouble (throttling, server side errors, timeouts, broken connections, DNS) is worth
//! retrying; credential and sink configuration problems are not. Anything unrecognized is treated
//! as retryable. The one exception to "authorization is terminal" is the event stream: right after
//! a role assignment its 401 responses name the missing `Send` claim until the grant propagates,
//! and those are retried.

use regex::Regex;
use reqwest::StatusCode;
use std::error::Error as StdError;
use std::sync::LazyLock;

use crate::error::ErrorKind;

static PERMISSION_PROPAGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)('send' claim|claim\(s\) are required|role assignment|not yet propagated|has not been granted)",
    )
    .expect("permission propagation pattern is valid")
});

/// Outcome of classifying a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Terminal,
}

/// The kind of remote a failed call was made against.
///
/// The same status means different things for different remotes: a 404 is a missing entity for
/// the store but a misconfigured rule for the log-ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCategory {
    Store,
    Analytics,
    Credentials,
    LogIngestion,
    EventStream,
    Catalog,
}

pub fn classify(kind: ErrorKind) -> Classification {
    match kind {
        ErrorKind::AuthenticationError
        | ErrorKind::PermissionDenied
        | ErrorKind::MalformedCredential
        | ErrorKind::SinkConfigurationError
        | ErrorKind::ConfigError
        | ErrorKind::QueryFailed
        | ErrorKind::EntityNotFound
        | ErrorKind::EntityAlreadyExists
        | ErrorKind::ConcurrencyConflict
        | ErrorKind::SerializationError
        | ErrorKind::DeserializationError
        | ErrorKind::RetriesExhausted
        | ErrorKind::InvalidState => Classification::Terminal,
        ErrorKind::RateLimited
        | ErrorKind::ServerError
        | ErrorKind::BadGateway
        | ErrorKind::ServiceUnavailable
        | ErrorKind::Timeout
        | ErrorKind::NetworkError
        | ErrorKind::ConnectionFailed
        | ErrorKind::DnsFailure
        | ErrorKind::PermissionPropagationPending
        | ErrorKind::ConnectivityError
        | ErrorKind::QueueManagerError
        | ErrorKind::IoError
        | ErrorKind::Unknown => Classification::Retryable,
    }
}

pub fn is_retryable(kind: ErrorKind) -> bool {
    classify(kind) == Classification::Retryable
}

/// Classifies an unsuccessful HTTP response.
pub fn classify_status(status: StatusCode, body: &str, category: CallCategory) -> ErrorKind {
    match (status, category) {
        (StatusCode::UNAUTHORIZED, CallCategory::EventStream)
            if PERMISSION_PROPAGATION.is_match(body) =>
        {
            ErrorKind::PermissionPropagationPending
        }
        (StatusCode::UNAUTHORIZED, _) => ErrorKind::AuthenticationError,
        (StatusCode::FORBIDDEN, _) => ErrorKind::PermissionDenied,
        (StatusCode::TOO_MANY_REQUESTS, _) => ErrorKind::RateLimited,
        (StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT, _) => ErrorKind::Timeout,
        (StatusCode::BAD_GATEWAY, _) => ErrorKind::BadGateway,
        (StatusCode::SERVICE_UNAVAILABLE, _) => ErrorKind::ServiceUnavailable,

        (StatusCode::NOT_FOUND, CallCategory::Store) => ErrorKind::EntityNotFound,
        (StatusCode::CONFLICT, CallCategory::Store) => ErrorKind::EntityAlreadyExists,
        (StatusCode::PRECONDITION_FAILED, CallCategory::Store) => ErrorKind::ConcurrencyConflict,

        (
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::PAYLOAD_TOO_LARGE,
            CallCategory::LogIngestion | CallCategory::EventStream,
        ) => ErrorKind::SinkConfigurationError,
        (StatusCode::BAD_REQUEST, CallCategory::Analytics) => ErrorKind::QueryFailed,
        (StatusCode::BAD_REQUEST, CallCategory::Credentials) => ErrorKind::MalformedCredential,

        (status, _) if status.is_server_error() => ErrorKind::ServerError,
        (_, _) => classify_message(body),
    }
}

/// Classifies a failure that only carries a message, such as a socket error or a panic payload.
pub fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_ascii_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| message.contains(needle));

    if contains_any(&["too many requests", "rate limit", "throttl"]) {
        ErrorKind::RateLimited
    } else if contains_any(&["bad gateway"]) {
        ErrorKind::BadGateway
    } else if contains_any(&["service unavailable"]) {
        ErrorKind::ServiceUnavailable
    } else if contains_any(&["internal server error"]) {
        ErrorKind::ServerError
    } else if contains_any(&["timed out", "timeout", "etimedout"]) {
        ErrorKind::Timeout
    } else if contains_any(&["enotfound", "dns", "failed to lookup address", "name resolution"]) {
        ErrorKind::DnsFailure
    } else if contains_any(&["econnrefused", "econnreset", "connection refused", "connection reset"])
    {
        ErrorKind::ConnectionFailed
    } else if contains_any(&["network", "broken pipe", "socket"]) {
        ErrorKind::NetworkError
    } else if contains_any(&["unauthorized", "authentication"]) {
        ErrorKind::AuthenticationError
    } else if contains_any(&["forbidden", "authorization", "permission"]) {
        ErrorKind::PermissionDenied
    } else if contains_any(&["malformed token", "invalid token", "invalid_grant"]) {
        ErrorKind::MalformedCredential
    } else {
        ErrorKind::Unknown
    }
}

/// Classifies a [`reqwest::Error`] that happened before or while reading a response.
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }

    if let Some(status) = err.status() {
        return classify_status(status, "", CallCategory::Catalog);
    }

    if err.is_connect() {
        let chain = error_chain(err);
        return match classify_message(&chain) {
            ErrorKind::DnsFailure => ErrorKind::DnsFailure,
            _ => ErrorKind::ConnectionFailed,
        };
    }

    if err.is_decode() {
        return ErrorKind::DeserializationError;
    }

    if err.is_request() || err.is_body() {
        return ErrorKind::NetworkError;
    }

    classify_message(&error_chain(err))
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kinds_are_retryable() {
        for kind in [
            ErrorKind::RateLimited,
            ErrorKind::ServerError,
            ErrorKind::BadGateway,
            ErrorKind::ServiceUnavailable,
            ErrorKind::Timeout,
            ErrorKind::NetworkError,
            ErrorKind::ConnectionFailed,
            ErrorKind::DnsFailure,
        ] {
            assert_eq!(classify(kind), Classification::Retryable, "{kind:?}");
        }
    }

    #[test]
    fn credential_and_sink_kinds_are_terminal() {
        for kind in [
            ErrorKind::AuthenticationError,
            ErrorKind::PermissionDenied,
            ErrorKind::MalformedCredential,
            ErrorKind::SinkConfigurationError,
        ] {
            assert_eq!(classify(kind), Classification::Terminal, "{kind:?}");
        }
    }

    #[test]
    fn unknown_faults_are_retryable() {
        assert_eq!(classify_message("something odd happened"), ErrorKind::Unknown);
        assert!(is_retryable(ErrorKind::Unknown));
    }

    #[test]
    fn event_stream_propagation_401_is_retryable() {
        let body = "Unauthorized access. 'Send' claim(s) are required to perform this operation.";

        let kind = classify_status(StatusCode::UNAUTHORIZED, body, CallCategory::EventStream);
        assert_eq!(kind, ErrorKind::PermissionPropagationPending);
        assert!(is_retryable(kind));

        // The same body on the log-ingestion path stays terminal.
        let kind = classify_status(StatusCode::UNAUTHORIZED, body, CallCategory::LogIngestion);
        assert_eq!(kind, ErrorKind::AuthenticationError);
        assert!(!is_retryable(kind));
    }

    #[test]
    fn plain_event_stream_401_is_terminal() {
        let kind = classify_status(
            StatusCode::UNAUTHORIZED,
            "InvalidSignature: token expired",
            CallCategory::EventStream,
        );
        assert_eq!(kind, ErrorKind::AuthenticationError);
    }

    #[test]
    fn store_statuses_map_to_entity_outcomes() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "", CallCategory::Store),
            ErrorKind::EntityNotFound
        );
        assert_eq!(
            classify_status(StatusCode::CONFLICT, "", CallCategory::Store),
            ErrorKind::EntityAlreadyExists
        );
        assert_eq!(
            classify_status(StatusCode::PRECONDITION_FAILED, "", CallCategory::Store),
            ErrorKind::ConcurrencyConflict
        );
    }

    #[test]
    fn sink_client_errors_are_configuration_errors() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "", CallCategory::LogIngestion),
            ErrorKind::SinkConfigurationError
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "", CallCategory::LogIngestion),
            ErrorKind::ServiceUnavailable
        );
        assert_eq!(
            classify_status(StatusCode::HTTP_VERSION_NOT_SUPPORTED, "", CallCategory::Analytics),
            ErrorKind::ServerError
        );
    }

    #[test]
    fn messages_are_matched_case_insensitively() {
        assert_eq!(classify_message("getaddrinfo ENOTFOUND host"), ErrorKind::DnsFailure);
        assert_eq!(classify_message("read ECONNRESET"), ErrorKind::ConnectionFailed);
        assert_eq!(classify_message("Request Timed Out"), ErrorKind::Timeout);
        assert_eq!(classify_message("429 Too Many Requests"), ErrorKind::RateLimited);
    }
}
