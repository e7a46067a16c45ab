//! Client for tools hosted by an external integration.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{ToolError, ToolResult};
use crate::core::realtime::ToolDef;

/// Remote integration exposing tools over some transport.
#[async_trait]
pub trait RemoteToolClient: Send + Sync {
    /// Tools the integration offers, declared to the endpoint at session start.
    async fn tools(&self) -> ToolResult<Vec<ToolDef>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> ToolResult<Value>;
}

#[derive(Debug, Deserialize)]
struct ToolList {
    #[serde(default)]
    tools: Vec<ToolDef>,
}

/// JSON-over-HTTP tool server.
///
/// - `GET {base}/tools` returns `{"tools": [descriptor, ...]}`
/// - `POST {base}/tools/{name}` with the arguments as body returns the result
#[derive(Debug, Clone)]
pub struct HttpToolClient {
    base: String,
    client: reqwest::Client,
}

impl HttpToolClient {
    pub fn new(base_url: &str, timeout: Duration) -> ToolResult<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ToolError::Remote(format!("Invalid tool server URL {}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ToolError::Remote(format!(
                "Unsupported tool server scheme: {}",
                parsed.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Remote(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base: parsed.as_str().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn check(response: reqwest::Response) -> ToolResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ToolError::Remote(format!("Tool server error {}: {}", status, body)))
    }
}

#[async_trait]
impl RemoteToolClient for HttpToolClient {
    async fn tools(&self) -> ToolResult<Vec<ToolDef>> {
        let response = self
            .client
            .get(format!("{}/tools", self.base))
            .send()
            .await
            .map_err(|e| ToolError::Remote(format!("Request failed: {}", e)))?;
        let list: ToolList = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ToolError::Remote(format!("Failed to parse tool list: {}", e)))?;
        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> ToolResult<Value> {
        tracing::debug!("Calling remote tool {}", name);
        let response = self
            .client
            .post(format!("{}/tools/{}", self.base, name))
            .json(&arguments)
            .send()
            .await
            .map_err(|e| ToolError::Remote(format!("Request failed: {}", e)))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ToolError::Remote(format!("Failed to parse tool result: {}", e)))
    }
}

/// Renders a remote result as a plain conversational message.
pub fn summarize_result(name: &str, result: &Value) -> String {
    let body = match result {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => result.to_string(),
        },
        other => other.to_string(),
    };
    format!("Result of {}: {}", name, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_rejects_bad_urls() {
        assert!(HttpToolClient::new("not a url", Duration::from_secs(1)).is_err());
        assert!(HttpToolClient::new("ftp://tools.local", Duration::from_secs(1)).is_err());
        assert!(HttpToolClient::new("http://tools.local/", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_summarize_result() {
        assert_eq!(
            summarize_result("weather", &json!("Sunny, 21C")),
            "Result of weather: Sunny, 21C"
        );
        assert_eq!(
            summarize_result("weather", &json!({"text": "Rain"})),
            "Result of weather: Rain"
        );
        assert_eq!(
            summarize_result("count", &json!({"n": 3})),
            r#"Result of count: {"n":3}"#
        );
    }

    #[tokio::test]
    async fn test_lists_tools() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tools": [
                    {"type": "function", "name": "get_weather", "description": "Weather",
                     "parameters": {"type": "object"}}
                ]
            })))
            .mount(&server)
            .await;

        let client = HttpToolClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let tools = client.tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_weather");
    }

    #[tokio::test]
    async fn test_calls_tool_with_arguments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/get_weather"))
            .and(body_json(json!({"lat": 1.5, "lon": 2.0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "Sunny"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpToolClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let result = client
            .call_tool("get_weather", json!({"lat": 1.5, "lon": 2.0}))
            .await
            .unwrap();
        assert_eq!(result["text"], "Sunny");
    }

    #[tokio::test]
    async fn test_server_error_maps_to_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = HttpToolClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let err = client.call_tool("broken", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Remote(ref msg) if msg.contains("500") && msg.contains("boom")));
    }
}
