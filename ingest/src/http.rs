//! Pulling contributions from HTTP(S) sources.

use crate::reader::ReadError;
use data_types::HttpMethod;
use futures::TryStreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// TLS, proxy and timeout policy of the ingest HTTP client.
#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// Verify the server certificate (host and peer). Disabling this
    /// accepts invalid certificates outright.
    pub verify_tls: bool,
    /// An additional PEM bundle to trust.
    pub ca_info: Option<PathBuf>,
    /// Proxy URL applied to all requests.
    pub proxy: Option<String>,
    /// Bound on establishing the connection.
    pub connect_timeout: Option<Duration>,
    /// Bound on the whole transfer.
    pub timeout: Option<Duration>,
    /// Bound on the wait for any single chunk of the body; a slower source
    /// counts as stalled.
    pub low_speed_time: Option<Duration>,
}

impl HttpClientConfig {
    /// A config verifying TLS with no timeouts, the production default.
    pub fn new() -> Self {
        Self {
            verify_tls: true,
            ..Default::default()
        }
    }

    /// Build the reqwest client for this policy.
    pub fn build_client(&self) -> Result<reqwest::Client, ReadError> {
        let mut builder =
            reqwest::Client::builder().danger_accept_invalid_certs(!self.verify_tls);
        if let Some(ca_info) = &self.ca_info {
            let pem = std::fs::read(ca_info).map_err(|e| ReadError::Http {
                message: format!("reading CA bundle {}: {}", ca_info.display(), e),
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| ReadError::Http {
                message: format!("parsing CA bundle {}: {}", ca_info.display(), e),
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| ReadError::Http {
                message: format!("bad proxy '{}': {}", proxy, e),
            })?;
            builder = builder.proxy(proxy);
        }
        if let Some(connect_timeout) = self.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().map_err(|e| ReadError::Http {
            message: format!("building HTTP client: {}", e),
        })
    }
}

/// One remote request specification.
#[derive(Debug, Clone)]
pub struct HttpSourceSpec {
    /// The source URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Optional request body.
    pub data: Option<String>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
}

/// Open an HTTP(S) source as an [`AsyncRead`] over the response body.
///
/// Non-2xx statuses fail here, before any byte reaches the temporary file.
pub async fn open_http_source(
    client: &reqwest::Client,
    spec: &HttpSourceSpec,
) -> Result<impl AsyncRead + Unpin + Send, ReadError> {
    let method = match spec.method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    };
    let mut request = client.request(method, &spec.url);
    for (name, value) in &spec.headers {
        request = request.header(name, value);
    }
    if let Some(data) = &spec.data {
        request = request.body(data.clone());
    }

    let response = request
        .send()
        .await
        .map_err(|e| ReadError::Http {
            message: format!("{}: {}", spec.url, e),
        })?
        .error_for_status()
        .map_err(|e| ReadError::Http {
            message: format!("{}: {}", spec.url, e),
        })?;

    let stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    Ok(StreamReader::new(stream))
}
