// src/extractor/http.rs

//! Reqwest-backed extractor.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use url::Url;

use crate::error::Result;
use crate::extractor::{Extractor, Outcome};
use crate::models::HttpConfig;
use crate::utils::duration_ms;

/// Fetches a locator with GET and maps the response to an [`Outcome`].
#[derive(Debug, Clone)]
pub struct HttpExtractor {
    client: Client,
}

impl HttpExtractor {
    /// Create a configured extractor.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }

    async fn read_success(response: Response, started: Instant) -> Outcome {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return map_reqwest_error(&e),
        };
        let latency_ms = duration_ms(started.elapsed());
        let size_bytes = bytes.len() as u64;

        let payload = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        let quality_score = if bytes.is_empty() { 0.0 } else { 1.0 };

        Outcome::Success {
            payload,
            quality_score,
            latency_ms,
            size_bytes,
        }
    }
}

/// `Retry-After` in its delta-seconds form. HTTP dates are ignored.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn map_reqwest_error(error: &reqwest::Error) -> Outcome {
    if error.is_timeout() {
        Outcome::transient("timeout", error.to_string())
    } else if error.is_connect() {
        Outcome::transient("connect", error.to_string())
    } else if error.is_builder() {
        Outcome::fatal("request", error.to_string())
    } else {
        Outcome::transient("network", error.to_string())
    }
}

fn map_status(status: StatusCode, retry_after: Option<Duration>) -> Outcome {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Outcome::NotFound,
        StatusCode::TOO_MANY_REQUESTS => Outcome::RateLimited { retry_after },
        s if s.is_server_error() => Outcome::transient(s.as_u16().to_string(), s.to_string()),
        s => Outcome::fatal(s.as_u16().to_string(), s.to_string()),
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(&self, source_locator: &str, timeout: Duration) -> Outcome {
        let url = match Url::parse(source_locator) {
            Ok(url) => url,
            Err(e) => return Outcome::fatal("invalid_url", format!("{source_locator}: {e}")),
        };

        let started = Instant::now();
        let response = match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => return map_reqwest_error(&e),
        };

        let status = response.status();
        log::debug!("GET {} -> {}", source_locator, status);
        if status.is_success() {
            Self::read_success(response, started).await
        } else {
            map_status(status, retry_after(&response))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn extractor() -> HttpExtractor {
        HttpExtractor::new(&HttpConfig::default()).unwrap()
    }

    async fn fetch(server: &MockServer, route: &str) -> Outcome {
        extractor()
            .extract(&format!("{}{}", server.uri(), route), Duration::from_secs(5))
            .await
    }

    #[tokio::test]
    async fn test_json_body_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"title":"ok"}"#))
            .mount(&server)
            .await;

        match fetch(&server, "/doc/1").await {
            Outcome::Success {
                payload,
                quality_score,
                size_bytes,
                ..
            } => {
                assert_eq!(payload["title"], "ok");
                assert_eq!(quality_score, 1.0);
                assert_eq!(size_bytes, 14);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plain_and_empty_bodies() {
        let server = MockServer::start().await;
        Mock::given(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;
        Mock::given(path("/empty"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        assert!(matches!(
            fetch(&server, "/text").await,
            Outcome::Success { payload: Value::String(ref s), .. } if s == "hello"
        ));
        assert!(matches!(
            fetch(&server, "/empty").await,
            Outcome::Success { quality_score, .. } if quality_score == 0.0
        ));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/gone"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;
        Mock::given(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/forbidden"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        assert_eq!(fetch(&server, "/missing").await, Outcome::NotFound);
        assert_eq!(fetch(&server, "/gone").await, Outcome::NotFound);
        assert_eq!(
            fetch(&server, "/busy").await,
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(matches!(
            fetch(&server, "/down").await,
            Outcome::TransientError { ref code, .. } if code == "503"
        ));
        assert!(matches!(
            fetch(&server, "/forbidden").await,
            Outcome::Fatal { ref code, .. } if code == "403"
        ));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let outcome = extractor()
            .extract(&format!("{}/slow", server.uri()), Duration::from_millis(100))
            .await;
        assert!(matches!(outcome, Outcome::TransientError { ref code, .. } if code == "timeout"));
    }

    #[tokio::test]
    async fn test_invalid_locator_is_fatal() {
        let outcome = extractor()
            .extract("not a url", Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, Outcome::Fatal { ref code, .. } if code == "invalid_url"));
    }
}
