use std::error;
use std::fmt;

use relay_config::shared::ValidationError;

use crate::classifier;

/// Result type used by every fallible relay operation.
pub type RelayResult<T> = Result<T, RelayError>;

/// Main error type of the relay.
///
/// A [`RelayError`] is either a single failure, described by an [`ErrorKind`], a static
/// description and an optional dynamic detail, or an aggregate of several failures. The kind is
/// what the rest of the engine acts on: the classifier decides retries from it and the processor
/// decides between isolating a table failure and stopping the run.
#[derive(Debug, Clone)]
pub struct RelayError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Many(Vec<RelayError>),
}

/// Categories of failures, grouped by the layer that produces them.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Run level
    ConfigError,
    ConnectivityError,
    QueueManagerError,
    RetriesExhausted,
    InvalidState,

    // Transport
    RateLimited,
    ServerError,
    BadGateway,
    ServiceUnavailable,
    Timeout,
    NetworkError,
    ConnectionFailed,
    DnsFailure,

    // Credentials
    AuthenticationError,
    PermissionDenied,
    MalformedCredential,
    PermissionPropagationPending,

    // Key-value store
    EntityNotFound,
    EntityAlreadyExists,
    ConcurrencyConflict,

    // Sinks and queries
    SinkConfigurationError,
    QueryFailed,

    // Encoding and io
    SerializationError,
    DeserializationError,
    IoError,

    Unknown,
}

impl RelayError {
    pub fn many(errors: Vec<RelayError>) -> RelayError {
        RelayError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the kind of this error, or of the first one for an aggregate.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Many(ref errors) => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![kind],
            ErrorRepr::Many(ref errors) => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Many(ref errors) => errors.iter().find_map(|e| e.detail()),
            ErrorRepr::WithDescription(..) => None,
        }
    }

    /// Whether repeating the failed call may succeed.
    ///
    /// An aggregate is retryable only when every member is.
    pub fn is_retryable(&self) -> bool {
        match self.repr {
            ErrorRepr::Many(ref errors) if !errors.is_empty() => {
                errors.iter().all(|err| err.is_retryable())
            }
            _ => classifier::is_retryable(self.kind()),
        }
    }

    /// Re-labels the error with a new kind and description, keeping the original as detail.
    pub fn reclassify(self, kind: ErrorKind, description: &'static str) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, self.to_string()),
        }
    }
}

impl PartialEq for RelayError {
    fn eq(&self, other: &RelayError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::WithDescription(kind_a, _), ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Many(errors_a), ErrorRepr::Many(errors_b)) => errors_a == errors_b,
            _ => false,
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => write!(f, "{kind:?}: {desc}"),
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                write!(f, "{kind:?}: {desc} -> {detail}")
            }
            ErrorRepr::Many(ref errors) => match errors.as_slice() {
                [] => f.write_str("no errors were recorded"),
                [single] => single.fmt(f),
                errors => {
                    write!(f, "{} errors occurred:", errors.len())?;
                    for (i, error) in errors.iter().enumerate() {
                        write!(f, "\n  {}: {}", i + 1, error)?;
                    }
                    Ok(())
                }
            },
        }
    }
}

impl error::Error for RelayError {}

impl From<(ErrorKind, &'static str)> for RelayError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RelayError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl<E> From<Vec<E>> for RelayError
where
    E: Into<RelayError>,
{
    fn from(errors: Vec<E>) -> RelayError {
        RelayError {
            repr: ErrorRepr::Many(errors.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::IoError,
                "I/O operation failed",
                err.to_string(),
            ),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> RelayError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

/// Transport failures are classified by what went wrong on the wire.
impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> RelayError {
        let kind = classifier::classify_transport(&err);

        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, "HTTP request failed", err.to_string()),
        }
    }
}

impl From<chrono::ParseError> for RelayError {
    fn from(err: chrono::ParseError) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::DeserializationError,
                "Timestamp parsing failed",
                err.to_string(),
            ),
        }
    }
}

impl From<base64::DecodeError> for RelayError {
    fn from(err: base64::DecodeError) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::MalformedCredential,
                "Shared key is not valid base64",
                err.to_string(),
            ),
        }
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(err: tokio::time::error::Elapsed) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::Timeout,
                "Operation did not finish in time",
                err.to_string(),
            ),
        }
    }
}

impl From<ValidationError> for RelayError {
    fn from(err: ValidationError) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::ConfigError,
                "Invalid configuration",
                err.to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_error;

    #[test]
    fn display_includes_kind_description_and_detail() {
        let err = relay_error!(ErrorKind::QueryFailed, "Query rejected", "bad syntax");
        assert_eq!(err.to_string(), "QueryFailed: Query rejected -> bad syntax");
        assert_eq!(err.detail(), Some("bad syntax"));
    }

    #[test]
    fn aggregate_reports_all_kinds() {
        let err = RelayError::many(vec![
            relay_error!(ErrorKind::Timeout, "slow"),
            relay_error!(ErrorKind::AuthenticationError, "denied"),
        ]);

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::Timeout, ErrorKind::AuthenticationError]
        );
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("2 errors occurred:"));
    }

    #[test]
    fn reclassify_keeps_original_message() {
        let err = relay_error!(ErrorKind::ServerError, "Store unavailable")
            .reclassify(ErrorKind::QueueManagerError, "Claim failed");

        assert_eq!(err.kind(), ErrorKind::QueueManagerError);
        assert!(err.detail().unwrap().contains("Store unavailable"));
    }

    #[test]
    fn validation_errors_are_config_errors() {
        let err: RelayError = ValidationError::MaxCyclesZero.into();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }
}
