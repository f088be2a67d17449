// HTTP request node
//
// URL and string bodies are template-interpolated against the input. The
// per-call timeout bounds in-flight work; there is no mid-call preemption.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec, ValidationOutcome};
use crate::template::interpolate;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

pub struct HttpRequestNode;

#[async_trait]
impl NodeHandler for HttpRequestNode {
    fn node_type(&self) -> &'static str {
        "http-request"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::required("url", FieldKind::String),
            FieldSpec::with_default("method", FieldKind::String, json!("GET")),
            FieldSpec::optional("headers", FieldKind::Object),
            FieldSpec::optional("body", FieldKind::Any),
            FieldSpec::with_default("timeoutMs", FieldKind::Integer, json!(DEFAULT_TIMEOUT_MS)),
            FieldSpec::with_default("failOnError", FieldKind::Boolean, json!(true)),
        ])
    }

    fn validate(&self, config: &Map<String, Value>) -> ValidationOutcome {
        let mut outcome = self.config_schema().check(config);
        if let Some(method) = config.get("method").and_then(Value::as_str) {
            if !METHODS.contains(&method.to_uppercase().as_str()) {
                outcome = outcome.merge(ValidationOutcome::from_errors(vec![format!(
                    "Unsupported HTTP method: {method}"
                )]));
            }
        }
        outcome
    }

    async fn execute(
        &self,
        input: &NodeInput,
        ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let raw_url = input
            .config_str("url")
            .ok_or_else(|| EngineError::node("http-request needs a url"))?;
        let url = interpolate(raw_url, &input.data);

        if url::Url::parse(&url).is_err() {
            return Err(EngineError::node(format!("Invalid URL: {url}")));
        }

        let method_str = input.config_str("method").unwrap_or("GET").to_uppercase();
        let method = method_str
            .parse::<Method>()
            .map_err(|_| EngineError::node(format!("Unsupported HTTP method: {method_str}")))?;

        let timeout_ms = input.config_u64("timeoutMs").unwrap_or(DEFAULT_TIMEOUT_MS);
        let fail_on_error = input.config_bool("failOnError").unwrap_or(true);

        let mut request = ctx
            .services()
            .http
            .request(method, &url)
            .timeout(Duration::from_millis(timeout_ms));

        if let Some(headers) = input.config().get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, interpolate(value, &input.data));
                }
            }
        }

        match input.config().get("body") {
            Some(Value::String(template)) => {
                request = request.body(interpolate(template, &input.data));
            }
            Some(body) if !body.is_null() => {
                request = request.json(body);
            }
            _ => {}
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::node(format!("HTTP request failed: {e}")))?;
        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("").to_string();

        let mut headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), Value::String(value.to_string()));
            }
        }

        let text = response
            .text()
            .await
            .map_err(|e| EngineError::node(format!("Failed to read HTTP response: {e}")))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        debug!(
            node_id = %ctx.node_id,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "http request finished"
        );

        if !status.is_success() && fail_on_error {
            return Err(EngineError::node(format!(
                "HTTP request returned {}: {}",
                status.as_u16(),
                status_text
            )));
        }

        Ok(json!({
            "status": status.as_u16(),
            "statusText": status_text,
            "headers": headers,
            "body": body,
            "ok": status.is_success(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::node::NodeInputMetadata;
    use crate::traits::EngineServices;
    use uuid::Uuid;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn run(config: Value, data: Value) -> Result<Value> {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "http",
            "http-request",
            &mut context,
            &services,
        );
        let input = NodeInput {
            data,
            metadata: NodeInputMetadata {
                node_config: config.as_object().cloned().unwrap_or_default(),
                execution_id: Uuid::now_v7(),
                workflow_id: Uuid::now_v7(),
            },
        };
        HttpRequestNode.execute(&input, &mut ctx).await
    }

    #[tokio::test]
    async fn get_returns_parsed_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1})))
            .mount(&server)
            .await;

        let output = run(
            json!({"url": format!("{}/data", server.uri())}),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output["status"], json!(200));
        assert_eq!(output["body"], json!({"ok": 1}));
        assert_eq!(output["ok"], json!(true));
    }

    #[tokio::test]
    async fn url_and_body_are_interpolated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/42"))
            .and(body_string("total=99"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let output = run(
            json!({
                "url": format!("{}/orders/{{{{order.id}}}}", server.uri()),
                "method": "POST",
                "body": "total={{order.total}}"
            }),
            json!({"order": {"id": 42, "total": 99}}),
        )
        .await
        .unwrap();
        assert_eq!(output["status"], json!(201));
    }

    #[tokio::test]
    async fn non_success_fails_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = run(
            json!({"url": format!("{}/missing", server.uri())}),
            json!({}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn non_success_is_returned_when_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let output = run(
            json!({"url": format!("{}/missing", server.uri()), "failOnError": false}),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output["status"], json!(404));
        assert_eq!(output["ok"], json!(false));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let err = run(json!({"url": "not a url"}), json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Invalid URL"));
    }
}
