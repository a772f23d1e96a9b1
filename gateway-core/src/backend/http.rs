//! HTTP backend (§4.C): posts a provider-shaped JSON body to a configured
//! endpoint and reads a single response envelope.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use super::{Backend, BackendResult, FailureKind};
use crate::config::HttpProviderConfig;
use crate::model::{BackendKind, Request};

/// Posts `{model?, prompt}` to `config.endpoint` with an optional bearer
/// auth header, honoring the caller's `timeout_s` as a hard deadline on the
/// whole call including connect.
pub struct HttpBackend {
    provider: String,
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(provider: String, config: HttpProviderConfig) -> Self {
        Self { provider, config, client: reqwest::Client::new() }
    }

    #[cfg(test)]
    pub fn with_client(provider: String, config: HttpProviderConfig, client: reqwest::Client) -> Self {
        Self { provider, config, client }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    #[tracing::instrument(skip(self, request), fields(provider = %self.provider, request_id = %request.id))]
    async fn execute(&self, request: &Request) -> BackendResult {
        let start = Instant::now();
        let timeout = Duration::from_secs(request.timeout_s);

        let body = json!({
            "model": self.config.model,
            "prompt": request.message,
        });

        let mut builder = self.client.post(&self.config.endpoint).timeout(timeout).json(&body);
        if let Some(header) = &self.config.auth_header {
            builder = builder.header("Authorization", header);
        }

        let send = builder.send();
        let result = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let kind = if e.is_timeout() { FailureKind::Timeout } else { FailureKind::UnreachableEndpoint };
                return BackendResult::err(e.to_string(), kind, elapsed_ms(start));
            }
            Err(_) => return BackendResult::err("request timed out", FailureKind::Timeout, elapsed_ms(start)),
        };

        let status = result.status();
        let text = match result.text().await {
            Ok(t) => t,
            Err(e) => return BackendResult::err(format!("failed to read response body: {e}"), FailureKind::ProtocolError, elapsed_ms(start)),
        };

        if !status.is_success() {
            let detail = short_error_detail(&text);
            return BackendResult::err(format!("HTTP {}: {}", status.as_u16(), detail), FailureKind::NonZeroExit, elapsed_ms(start));
        }

        match parse_response_envelope(&text) {
            Ok((response, tokens_used)) => {
                let mut result = BackendResult::ok(response, elapsed_ms(start));
                result.tokens_used = tokens_used;
                result
            }
            Err(e) => BackendResult::err(e, FailureKind::ProtocolError, elapsed_ms(start)),
        }
    }

    async fn health_check(&self) -> bool {
        match self.client.get(&self.config.endpoint).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    async fn shutdown(&self) {}

    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn short_error_detail(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Accepts either a bare JSON string response or a `{response|text|content}`
/// envelope with an optional `tokens_used`/`usage.total_tokens` field.
fn parse_response_envelope(text: &str) -> Result<(String, Option<u64>), String> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        // Some providers reply with a bare text body rather than JSON.
        Err(_) => return Ok((text.to_string(), None)),
    };

    if let Some(s) = value.as_str() {
        return Ok((s.to_string(), None));
    }

    let response = value
        .get("response")
        .or_else(|| value.get("text"))
        .or_else(|| value.get("content"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| "response envelope missing response/text/content field".to_string())?;

    let tokens_used = value
        .get("tokens_used")
        .and_then(|v| v.as_u64())
        .or_else(|| value.get("usage").and_then(|u| u.get("total_tokens")).and_then(|v| v.as_u64()));

    Ok((response, tokens_used))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_string_envelope() {
        let (resp, tokens) = parse_response_envelope("\"hi\"").unwrap();
        assert_eq!(resp, "hi");
        assert_eq!(tokens, None);
    }

    #[test]
    fn parses_response_field_with_usage() {
        let (resp, tokens) = parse_response_envelope(r#"{"response":"hi","usage":{"total_tokens":42}}"#).unwrap();
        assert_eq!(resp, "hi");
        assert_eq!(tokens, Some(42));
    }

    #[test]
    fn falls_back_to_raw_text_for_non_json_body() {
        let (resp, tokens) = parse_response_envelope("plain text reply").unwrap();
        assert_eq!(resp, "plain text reply");
        assert_eq!(tokens, None);
    }

    #[test]
    fn rejects_json_object_missing_known_fields() {
        assert!(parse_response_envelope(r#"{"unexpected":"shape"}"#).is_err());
    }

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(endpoint: String) -> HttpProviderConfig {
        HttpProviderConfig { endpoint, auth_header: Some("Bearer test-key".to_string()), model: Some("test-model".to_string()) }
    }

    #[test_log::test(tokio::test)]
    async fn execute_returns_success_on_200() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "hi there", "tokens_used": 7})))
            .mount(&mock_server)
            .await;

        let backend = HttpBackend::with_client("echo".to_string(), config_for(mock_server.uri()), reqwest::Client::new());
        let request = Request::new("echo", "hello", 50, 30);
        let result = backend.execute(&request).await;

        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("hi there"));
        assert_eq!(result.tokens_used, Some(7));
    }

    #[test_log::test(tokio::test)]
    async fn execute_reports_failure_on_non_2xx() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500).set_body_string("boom")).mount(&mock_server).await;

        let backend = HttpBackend::with_client("echo".to_string(), config_for(mock_server.uri()), reqwest::Client::new());
        let request = Request::new("echo", "hello", 50, 30);
        let result = backend.execute(&request).await;

        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(FailureKind::NonZeroExit));
        assert!(result.error.unwrap().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn health_check_reflects_endpoint_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&mock_server).await;

        let backend = HttpBackend::with_client("echo".to_string(), config_for(mock_server.uri()), reqwest::Client::new());
        assert!(backend.health_check().await);
    }
}
