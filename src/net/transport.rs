use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use thiserror::Error;
use url::Url;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const MAX_REDIRECT_HOPS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub form: Vec<(String, String)>,
    pub referer: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            form: Vec::new(),
            referer: None,
        }
    }

    pub fn post_form(url: impl Into<String>, form: &[(&str, &str)]) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            form: form
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            referer: None,
        }
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectHop {
    pub status: u16,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub redirects: Vec<RedirectHop>,
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// One network round trip. Implementations follow redirects themselves and
/// report every hop in [`HttpResponse::redirects`].
pub trait Transport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking reqwest transport with manual redirect following.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("es-CL,es;q=0.9,en;q=0.8"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|error| TransportError::Other(error.to_string()))?;

        Ok(Self { client })
    }

    fn send_once(
        &self,
        method: Method,
        url: &str,
        request: &HttpRequest,
    ) -> Result<reqwest::blocking::Response, TransportError> {
        let mut builder = match method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url).form(&request.form),
        };
        if let Some(referer) = &request.referer {
            builder = builder.header(reqwest::header::REFERER, referer.as_str());
        }
        builder.send().map_err(classify_reqwest_error)
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let mut method = request.method;
        let mut current = request.url.clone();
        let mut redirects = Vec::new();

        loop {
            let response = self.send_once(method, &current, request)?;
            let status = response.status().as_u16();

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .map(ToOwned::to_owned);

                if let Some(location) = location {
                    if redirects.len() >= MAX_REDIRECT_HOPS {
                        return Err(TransportError::Other(format!(
                            "redirect limit of {MAX_REDIRECT_HOPS} exceeded at {current}"
                        )));
                    }
                    let next = resolve_location(&current, &location)?;
                    redirects.push(RedirectHop {
                        status,
                        from: current.clone(),
                        to: next.clone(),
                    });
                    if matches!(status, 301..=303) {
                        method = Method::Get;
                    }
                    current = next;
                    continue;
                }
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned);
            let final_url = response.url().to_string();
            let body = response
                .bytes()
                .map_err(classify_reqwest_error)?
                .to_vec();

            return Ok(HttpResponse {
                status,
                final_url,
                body,
                content_type,
                redirects,
                elapsed: started.elapsed(),
            });
        }
    }
}

fn resolve_location(current: &str, location: &str) -> Result<String, TransportError> {
    let base = Url::parse(current)
        .map_err(|error| TransportError::Other(format!("invalid url {current}: {error}")))?;
    base.join(location)
        .map(|url| url.to_string())
        .map_err(|error| TransportError::Other(format!("invalid redirect {location}: {error}")))
}

fn classify_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_location_handles_relative_paths() {
        let next = resolve_location(
            "https://www.cmfchile.cl/institucional/mercados/entidad.php?rut=1",
            "/603/pages/viewer.php?id=2",
        )
        .expect("relative redirect should resolve");
        assert_eq!(next, "https://www.cmfchile.cl/603/pages/viewer.php?id=2");
    }

    #[test]
    fn post_form_keeps_field_order() {
        let request = HttpRequest::post_form("https://x/y", &[("pestania", "68"), ("serie", "A")]);
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.form[0], ("pestania".to_string(), "68".to_string()));
        assert_eq!(request.form[1].0, "serie");
    }
}
