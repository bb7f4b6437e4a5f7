//! reqwest-backed transport
//!
//! Joins the configured base URL with each request path, encodes JSON and
//! multipart bodies, and applies a per-request timeout. Multipart bodies are
//! built as `reqwest::multipart::Form` so reqwest writes the
//! `multipart/form-data; boundary=...` content type itself.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::{ApiRequest, ApiResponse, MultipartPart, RequestBody, Result, Transport, TransportError};

/// Default request timeout, matching the mobile client's 10 second budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Production transport over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, timeout)
    }

    /// Reuse an existing client (connection pool, TLS config).
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = self.url(&request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone())
            .timeout(self.timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(parts) => builder.multipart(build_form(parts)?),
        };

        let response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;

        debug!(
            method = %request.method,
            url = %url,
            status,
            bytes = body.len(),
            "transport response"
        );
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}

fn build_form(parts: &[MultipartPart]) -> Result<Form> {
    let mut form = Form::new();
    for part in parts {
        form = match part {
            MultipartPart::Text { name, value } => form.text(name.clone(), value.clone()),
            MultipartPart::File {
                name,
                file_name,
                mime_type,
                bytes,
            } => {
                let file = Part::bytes(bytes.to_vec())
                    .file_name(file_name.clone())
                    .mime_str(mime_type)
                    .map_err(|e| {
                        TransportError::Request(format!("invalid mime type {mime_type:?}: {e}"))
                    })?;
                form.part(name.clone(), file)
            }
        };
    }
    Ok(form)
}

fn classify_send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn url_joins_base_and_path() {
        let transport = ReqwestTransport::new("https://api.example.com/", DEFAULT_TIMEOUT);
        assert_eq!(transport.url("/auth/login"), "https://api.example.com/auth/login");
        assert_eq!(transport.url("products"), "https://api.example.com/products");
    }

    #[tokio::test]
    async fn sends_json_body_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/export/labels"))
            .and(query_param("format", "pdf"))
            .and(body_json(serde_json::json!({"productIds": [1, 2]})))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"success": true})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(server.uri(), DEFAULT_TIMEOUT);
        let request = ApiRequest::post("/export/labels")
            .with_query("format", "pdf")
            .with_json(serde_json::json!({"productIds": [1, 2]}));

        let response = transport.send(&request).await.unwrap();
        assert_eq!(response.status, 201);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/products"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"message": "Unauthorized"})),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(server.uri(), DEFAULT_TIMEOUT);
        let response = transport.send(&ApiRequest::get("/products")).await.unwrap();
        assert!(response.is_unauthorized());
        assert_eq!(response.error_message().as_deref(), Some("Unauthorized"));
    }

    #[tokio::test]
    async fn forwards_request_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/refresh"))
            .and(header("x-refresh-token", "rt_abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(server.uri(), DEFAULT_TIMEOUT);
        let request = ApiRequest::get("/auth/refresh").with_header(
            crate::HeaderName::from_static("x-refresh-token"),
            crate::HeaderValue::from_static("rt_abc"),
        );
        let response = transport.send(&request).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn multipart_body_carries_boundary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/import/products"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(server.uri(), DEFAULT_TIMEOUT);
        let request = ApiRequest::post("/import/products").with_multipart(vec![
            MultipartPart::file("file", "stock.csv", "text/csv", &b"code,name\nA1,Widget\n"[..]),
            MultipartPart::text("mappings", r#"{"code":"productCode"}"#),
        ]);
        transport.send(&request).await.unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let content_type = received[0]
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(
            content_type.starts_with("multipart/form-data; boundary="),
            "got: {content_type}"
        );
        let body = String::from_utf8_lossy(&received[0].body);
        assert!(body.contains("filename=\"stock.csv\""));
        assert!(body.contains("A1,Widget"));
        assert!(body.contains("productCode"));
    }

    #[tokio::test]
    async fn slow_response_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stock"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(server.uri(), Duration::from_millis(50));
        let err = transport.send(&ApiRequest::get("/stock")).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let transport = ReqwestTransport::new("http://127.0.0.1:1", DEFAULT_TIMEOUT);
        let err = transport.send(&ApiRequest::get("/orders")).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "got: {err:?}");
    }
}
