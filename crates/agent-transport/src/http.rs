//! HTTP delivery to the collector.

use crate::config::TransportConfig;
use crate::transport::MessageTransport;
use crate::{Destination, ResponseStatus, TransportError, TransportResult};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Certificate, Client, Method};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Content type sent when the serializer did not declare one.
const ANY_CONTENT_TYPE: &str = "*/*";

/// Client settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Sent as `X-Api-Key` when present.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Gzip request bodies.
    pub gzip: bool,
    /// PEM bundle trusted in addition to the system roots (https only).
    pub ssl_truststore: Option<PathBuf>,
    /// Skip certificate verification (https only).
    pub ssl_trust_all: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            timeout: Duration::from_secs(30),
            gzip: true,
            ssl_truststore: None,
            ssl_trust_all: false,
        }
    }
}

impl From<&TransportConfig> for HttpOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            timeout: config.request_timeout(),
            gzip: config.gzip_compression,
            ssl_truststore: config.ssl_truststore.clone(),
            ssl_trust_all: config.ssl_trust_all,
        }
    }
}

/// One HTTP request per attempt against the collector.
///
/// The destination type names the method, the target is resolved against
/// the collector URL.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    gzip: bool,
}

impl HttpTransport {
    pub fn new(collector_url: &str, options: HttpOptions) -> TransportResult<Self> {
        let base_url = Url::parse(collector_url)?;

        let mut builder = Client::builder().timeout(options.timeout);
        if base_url.scheme() == "https" {
            if let Some(path) = &options.ssl_truststore {
                let pem = std::fs::read(path)?;
                for certificate in Certificate::from_pem_bundle(&pem)? {
                    builder = builder.add_root_certificate(certificate);
                }
                debug!(truststore = %path.display(), "Trusting extra root certificates");
            }
            if options.ssl_trust_all {
                warn!("Collector certificate verification is disabled");
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        Ok(Self {
            client: builder.build()?,
            base_url,
            api_key: options.api_key,
            gzip: options.gzip,
        })
    }

    pub fn from_config(config: &TransportConfig) -> TransportResult<Self> {
        Self::new(&config.collector_url, HttpOptions::from(config))
    }

    fn method_for(destination: &Destination) -> TransportResult<Method> {
        match destination.kind.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            _ => Err(TransportError::UnsupportedMethod(destination.kind.clone())),
        }
    }

    fn url_for(&self, destination: &Destination) -> TransportResult<Url> {
        Ok(self.base_url.join(&destination.target)?)
    }
}

fn gzip(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn send(
        &self,
        destination: &Destination,
        payload: &[u8],
        content_type: &str,
    ) -> TransportResult<ResponseStatus> {
        let method = Self::method_for(destination)?;
        let url = self.url_for(destination)?;
        let content_type = if content_type.is_empty() {
            ANY_CONTENT_TYPE
        } else {
            content_type
        };

        debug!(method = %method, url = %url, bytes = payload.len(), gzip = self.gzip, "Sending request");

        let mut request = self
            .client
            .request(method.clone(), url)
            .header(CONTENT_TYPE, content_type);
        if let Some(api_key) = &self.api_key {
            request = request.header("X-Api-Key", api_key);
        }
        if method != Method::GET {
            request = if self.gzip {
                request.header(CONTENT_ENCODING, "gzip").body(gzip(payload)?)
            } else {
                request.body(payload.to_vec())
            };
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(ResponseStatus::ok().with_status_code(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        Ok(ResponseStatus::failed(format!("HTTP {}: {}", status, body)).with_status_code(status.as_u16()))
    }
}
