//! Maps extractor outcomes to ledger verdicts.

use std::time::Duration;

use serde_json::Value;

use crate::extractor::Outcome;
use crate::models::{ErrorClass, ErrorDetail, ItemError};

/// Signal forwarded to the rate governor alongside a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub status_code: u16,
    pub retry_after: Option<Duration>,
}

/// Why an item goes back for another attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryCause {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    pub rejection: Option<Rejection>,
}

impl RetryCause {
    pub fn new(class: ErrorClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
            message: message.into(),
            rejection: None,
        }
    }

    /// The extractor did not answer within the per-item deadline.
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorClass::Timeout,
            "timeout",
            format!("extraction exceeded {after:?}"),
        )
    }

    /// Per-item processing panicked.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internal, "panic", message)
    }

    /// Sink or ledger write failed after a successful extraction.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Storage, "storage", message)
    }

    pub fn item_error(&self) -> ItemError {
        ItemError::new(&self.code, &self.message)
    }

    pub fn detail(&self, retry_attempt: u32) -> ErrorDetail {
        ErrorDetail {
            class: self.class,
            code: self.code.clone(),
            message: self.message.clone(),
            retry_attempt,
        }
    }
}

/// What the write step should do with an item.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Complete {
        payload: Value,
        latency_ms: u64,
        size_bytes: u64,
    },
    Invalid {
        reason: String,
        /// The remote reported the resource missing, which is not a rejection
        not_found: bool,
    },
    Retry(RetryCause),
}

/// Classify one extractor outcome.
pub fn classify(outcome: Outcome, min_quality: f64) -> Verdict {
    match outcome {
        Outcome::Success {
            payload,
            quality_score,
            latency_ms,
            size_bytes,
        } => {
            if quality_score >= min_quality {
                Verdict::Complete {
                    payload,
                    latency_ms,
                    size_bytes,
                }
            } else {
                Verdict::Invalid {
                    reason: format!("quality {quality_score:.2} below minimum {min_quality:.2}"),
                    not_found: false,
                }
            }
        }
        Outcome::NotFound => Verdict::Invalid {
            reason: "not found".to_string(),
            not_found: true,
        },
        Outcome::RateLimited { retry_after } => Verdict::Retry(RetryCause {
            rejection: Some(Rejection {
                status_code: 429,
                retry_after,
            }),
            ..RetryCause::new(ErrorClass::RateLimited, "429", "rate limited by remote")
        }),
        Outcome::TransientError { code, message } => {
            match code.parse::<u16>() {
                Ok(status) if (500..600).contains(&status) => Verdict::Retry(RetryCause {
                    rejection: Some(Rejection {
                        status_code: status,
                        retry_after: None,
                    }),
                    ..RetryCause::new(ErrorClass::ServerError, code, message)
                }),
                _ if code == "timeout" => {
                    Verdict::Retry(RetryCause::new(ErrorClass::Timeout, code, message))
                }
                _ => Verdict::Retry(RetryCause::new(ErrorClass::Transient, code, message)),
            }
        }
        Outcome::Fatal { code, message } => {
            Verdict::Retry(RetryCause::new(ErrorClass::Unexpected, code, message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn success(quality_score: f64) -> Outcome {
        Outcome::Success {
            payload: json!({"k": "v"}),
            quality_score,
            latency_ms: 12,
            size_bytes: 34,
        }
    }

    #[test]
    fn test_success_against_quality_threshold() {
        assert!(matches!(
            classify(success(0.9), 0.5),
            Verdict::Complete {
                latency_ms: 12,
                size_bytes: 34,
                ..
            }
        ));
        assert!(matches!(
            classify(success(0.5), 0.5),
            Verdict::Complete { .. }
        ));
        assert!(matches!(
            classify(success(0.1), 0.5),
            Verdict::Invalid {
                not_found: false,
                ..
            }
        ));
    }

    #[test]
    fn test_not_found_is_invalid() {
        assert!(matches!(
            classify(Outcome::NotFound, 0.0),
            Verdict::Invalid {
                not_found: true,
                ..
            }
        ));
    }

    #[test]
    fn test_rate_limited_carries_rejection() {
        let verdict = classify(
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            },
            0.0,
        );
        let Verdict::Retry(cause) = verdict else {
            panic!("expected retry");
        };
        assert_eq!(cause.class, ErrorClass::RateLimited);
        assert_eq!(
            cause.rejection,
            Some(Rejection {
                status_code: 429,
                retry_after: Some(Duration::from_secs(5)),
            })
        );
    }

    #[test]
    fn test_transient_error_classes() {
        let class_of = |code: &str| match classify(Outcome::transient(code, "x"), 0.0) {
            Verdict::Retry(cause) => (cause.class, cause.rejection.is_some()),
            other => panic!("unexpected verdict {other:?}"),
        };
        assert_eq!(class_of("503"), (ErrorClass::ServerError, true));
        assert_eq!(class_of("timeout"), (ErrorClass::Timeout, false));
        assert_eq!(class_of("connect"), (ErrorClass::Transient, false));
        assert_eq!(class_of("408"), (ErrorClass::Transient, false));
    }

    #[test]
    fn test_fatal_is_retried_as_unexpected() {
        let Verdict::Retry(cause) = classify(Outcome::fatal("403", "forbidden"), 0.0) else {
            panic!("expected retry");
        };
        assert_eq!(cause.class, ErrorClass::Unexpected);
        assert_eq!(cause.item_error(), ItemError::new("403", "forbidden"));
        assert_eq!(cause.detail(2).retry_attempt, 2);
    }
}
