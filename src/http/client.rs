use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::debug;

use super::request::ResolvedRequest;
use super::response::HttpResponse;

/// Failures that prevent a request from completing at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request failed: {0}")]
    Transport(String),
}

/// Sends one resolved request and returns the response.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &ResolvedRequest) -> Result<HttpResponse, RequestError>;
}

/// [`HttpExecutor`] backed by a shared `reqwest` client.
pub struct ReqwestExecutor {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestExecutor {
    pub fn new(timeout: Duration) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .build()
            .map_err(|err| RequestError::Transport(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &ResolvedRequest) -> Result<HttpResponse, RequestError> {
        let url = reqwest::Url::parse(&request.url).map_err(|err| RequestError::InvalidUrl {
            url: request.url.clone(),
            reason: err.to_string(),
        })?;
        let headers = build_headers(request)?;

        let mut req_builder = self
            .client
            .request(request.method.into(), url)
            .headers(headers);
        if let Some(body) = &request.body {
            if !request.method.is_bodyless() {
                req_builder = req_builder.body(body.clone());
            }
        }

        debug!(method = %request.method, url = %request.url, "sending request");
        let started = Instant::now();
        let response = req_builder.send().await.map_err(|err| self.classify(err))?;

        let status_code = response.status().as_u16();
        let mut result = HttpResponse::new(status_code);
        for (name, value) in response.headers() {
            let value = value.to_str().unwrap_or("<binary>");
            result.insert_header(name.as_str(), value);
        }

        let bytes = response.bytes().await.map_err(|err| self.classify(err))?;
        result.body = String::from_utf8_lossy(&bytes).into_owned();
        result.duration = started.elapsed();
        debug!(status = status_code, elapsed_ms = result.duration_ms(), "response received");

        Ok(result)
    }
}

impl ReqwestExecutor {
    fn classify(&self, err: reqwest::Error) -> RequestError {
        if err.is_timeout() {
            RequestError::Timeout(self.timeout)
        } else {
            RequestError::Transport(err.to_string())
        }
    }
}

fn build_headers(request: &ResolvedRequest) -> Result<HeaderMap, RequestError> {
    let mut headers = HeaderMap::new();

    for (key, value) in &request.headers {
        if key.is_empty() {
            continue;
        }

        let header_name =
            HeaderName::from_bytes(key.as_bytes()).map_err(|err| RequestError::InvalidHeader {
                name: key.clone(),
                reason: err.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|err| RequestError::InvalidHeader {
            name: key.clone(),
            reason: err.to_string(),
        })?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

/// Default `Content-Type` for a request body when the request sets none.
/// Bodyless methods never send their body, so they get no header either.
pub(crate) fn ensure_content_type(request: &mut ResolvedRequest, content_type: &str) {
    if request.body.is_some() && !request.method.is_bodyless() && request.header(CONTENT_TYPE.as_str()).is_none() {
        request
            .headers
            .insert("Content-Type".to_string(), content_type.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::http::HttpMethod;

    fn request(headers: &[(&str, &str)], body: Option<&str>) -> ResolvedRequest {
        ResolvedRequest {
            method: HttpMethod::Post,
            url: "https://example.com".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            body: body.map(str::to_string),
        }
    }

    #[test]
    fn build_headers_rejects_invalid_name() {
        let err = build_headers(&request(&[("bad header", "x")], None)).unwrap_err();
        assert!(matches!(err, RequestError::InvalidHeader { ref name, .. } if name == "bad header"));
    }

    #[test]
    fn content_type_added_only_when_missing() {
        let mut with_body = request(&[], Some("{}"));
        ensure_content_type(&mut with_body, "application/json");
        assert_eq!(with_body.header("content-type"), Some("application/json"));

        let mut explicit = request(&[("content-type", "text/plain")], Some("hi"));
        ensure_content_type(&mut explicit, "application/json");
        assert_eq!(explicit.header("Content-Type"), Some("text/plain"));
        assert_eq!(explicit.headers.len(), 1);

        let mut no_body = request(&[], None);
        ensure_content_type(&mut no_body, "application/json");
        assert!(no_body.headers.is_empty());
    }

    #[test]
    fn bodyless_methods_get_no_content_type() {
        for method in [HttpMethod::Get, HttpMethod::Head, HttpMethod::Options] {
            let mut req = request(&[], Some("{}"));
            req.method = method;
            ensure_content_type(&mut req, "application/json");
            assert!(req.headers.is_empty(), "{method} got a content type");
        }
    }

    #[tokio::test]
    async fn invalid_url_is_reported_without_sending() {
        let executor = ReqwestExecutor::new(Duration::from_secs(1)).unwrap();
        let mut req = request(&[], None);
        req.url = "not a url".to_string();
        let err = executor.execute(&req).await.unwrap_err();
        assert!(matches!(err, RequestError::InvalidUrl { .. }));
    }
}
