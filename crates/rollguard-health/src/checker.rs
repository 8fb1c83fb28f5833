//! Network probes: TCP connect and HTTP GET.

use std::time::Duration;

use http::Uri;
use tracing::debug;

use crate::probe::{Probe, ProbeFuture, ProbeOutcome, ProbeSpec};

const USER_AGENT: &str = concat!("rollguard-health/", env!("CARGO_PKG_VERSION"));

/// Healthy when a TCP connection to `address` can be opened.
pub struct TcpProbe {
    spec: ProbeSpec,
    address: String,
}

impl TcpProbe {
    pub fn new(spec: ProbeSpec, address: &str) -> Self {
        Self {
            spec,
            address: address.to_string(),
        }
    }
}

impl Probe for TcpProbe {
    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn check(&self, _timeout: Duration) -> ProbeFuture<'_> {
        Box::pin(async move {
            match tokio::net::TcpStream::connect(self.address.as_str()).await {
                Ok(_) => ProbeOutcome::healthy(format!("connected to {}", self.address)),
                Err(e) => {
                    debug!(probe = %self.spec.name, address = %self.address, error = %e, "tcp probe failed");
                    ProbeOutcome::unhealthy(format!("connection to {} failed: {e}", self.address))
                }
            }
        })
    }
}

/// HTTP/1.1 GET against a plain `http://` URL.
///
/// 2xx is healthy, 5xx unhealthy, any other status degraded. A connection
/// or protocol failure is unhealthy.
pub struct HttpProbe {
    spec: ProbeSpec,
    url: String,
}

impl HttpProbe {
    pub fn new(spec: ProbeSpec, url: &str) -> Self {
        Self {
            spec,
            url: url.to_string(),
        }
    }
}

impl Probe for HttpProbe {
    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn check(&self, _timeout: Duration) -> ProbeFuture<'_> {
        Box::pin(async move {
            match http_get(&self.url).await {
                Ok(status) => outcome_for_status(status),
                Err(message) => {
                    debug!(probe = %self.spec.name, url = %self.url, error = %message, "http probe failed");
                    ProbeOutcome::unhealthy(message)
                }
            }
        })
    }
}

fn outcome_for_status(status: http::StatusCode) -> ProbeOutcome {
    if status.is_success() {
        ProbeOutcome::healthy(format!("HTTP {}", status.as_u16()))
    } else if status.is_server_error() {
        ProbeOutcome::unhealthy(format!("HTTP {}", status.as_u16()))
    } else {
        ProbeOutcome::degraded(format!("HTTP {}", status.as_u16()))
    }
}

/// Issue one GET and return the response status.
pub(crate) async fn http_get(url: &str) -> Result<http::StatusCode, String> {
    let uri: Uri = url.parse().map_err(|e| format!("invalid url {url}: {e}"))?;
    let host = uri.host().ok_or_else(|| format!("url {url} has no host"))?;
    let port = uri.port_u16().unwrap_or(80);
    let authority = format!("{host}:{port}");
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let stream = tokio::net::TcpStream::connect(authority.as_str())
        .await
        .map_err(|e| format!("connection to {authority} failed: {e}"))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| format!("handshake with {authority} failed: {e}"))?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", authority.as_str())
        .header("user-agent", USER_AGENT)
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| format!("invalid request for {url}: {e}"))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| format!("request to {url} failed: {e}"))?;
    Ok(resp.status())
}
