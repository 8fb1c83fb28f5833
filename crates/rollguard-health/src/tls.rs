//! TLS certificate probe.
//!
//! The handshake itself accepts any certificate so that an expired or
//! untrusted chain can still be inspected; the captured chain is then
//! verified against the root store twice, at "now" and at
//! "now + warn_days".

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::probe::{CertificateStatus, Probe, ProbeFuture, ProbeOutcome, ProbeSpec};

const SECS_PER_DAY: u64 = 86_400;

/// Verifier that lets every chain through the handshake. Signatures are
/// still checked so the peer must hold the certificate's key.
#[derive(Debug)]
struct CapturingVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Checks that `host` presents a certificate valid now and for the next
/// `warn_days`.
pub struct TlsCertificateProbe {
    spec: ProbeSpec,
    host: String,
    port: u16,
    warn_days: u32,
    connect_address: Option<String>,
    roots: Arc<RootCertStore>,
}

impl TlsCertificateProbe {
    /// Probe trusting the bundled webpki roots.
    pub fn new(spec: ProbeSpec, host: &str, port: u16, warn_days: u32) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(spec, host, port, warn_days, roots)
    }

    pub fn with_roots(
        spec: ProbeSpec,
        host: &str,
        port: u16,
        warn_days: u32,
        roots: RootCertStore,
    ) -> Self {
        Self {
            spec,
            host: host.to_string(),
            port,
            warn_days,
            connect_address: None,
            roots: Arc::new(roots),
        }
    }

    /// Dial `address` instead of resolving `host`; `host` is still the
    /// name the certificate must match.
    pub fn with_connect_address(mut self, address: &str) -> Self {
        self.connect_address = Some(address.to_string());
        self
    }

    fn certificate(&self, valid: bool, expiring_soon: bool) -> CertificateStatus {
        CertificateStatus {
            host: self.host.clone(),
            valid,
            expiring_soon,
            warn_days: self.warn_days,
        }
    }

    async fn inspect(&self) -> Result<ProbeOutcome, String> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = verifier(&self.roots, &provider)?;

        let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| format!("tls config: {e}"))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CapturingVerifier {
                inner: Arc::clone(&verifier),
            }))
            .with_no_client_auth();

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| format!("invalid server name {}: {e}", self.host))?;

        let address = self
            .connect_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port));
        let stream = tokio::net::TcpStream::connect(address.as_str())
            .await
            .map_err(|e| format!("connection to {address} failed: {e}"))?;
        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name.clone(), stream)
            .await
            .map_err(|e| format!("tls handshake with {address} failed: {e}"))?;

        let (_, session) = tls.get_ref();
        let chain: Vec<CertificateDer<'static>> = session
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return Ok(ProbeOutcome::unhealthy("peer presented no certificate")
                .with_certificate(self.certificate(false, false)));
        };

        let now = UnixTime::now();
        if let Err(e) = verifier.verify_server_cert(end_entity, intermediates, &server_name, &[], now) {
            debug!(probe = %self.spec.name, host = %self.host, error = %e, "certificate invalid");
            return Ok(ProbeOutcome::unhealthy(format!("certificate invalid: {e}"))
                .with_certificate(self.certificate(false, false)));
        }

        let horizon = UnixTime::since_unix_epoch(Duration::from_secs(
            now.as_secs() + u64::from(self.warn_days) * SECS_PER_DAY,
        ));
        if let Err(e) = verifier.verify_server_cert(end_entity, intermediates, &server_name, &[], horizon) {
            debug!(probe = %self.spec.name, host = %self.host, error = %e, "certificate expiring");
            return Ok(ProbeOutcome::degraded(format!(
                "certificate expires within {} days",
                self.warn_days
            ))
            .with_certificate(self.certificate(true, true)));
        }

        Ok(ProbeOutcome::healthy("certificate valid").with_certificate(self.certificate(true, false)))
    }
}

fn verifier(
    roots: &Arc<RootCertStore>,
    provider: &Arc<CryptoProvider>,
) -> Result<Arc<WebPkiServerVerifier>, String> {
    WebPkiServerVerifier::builder_with_provider(Arc::clone(roots), Arc::clone(provider))
        .build()
        .map_err(|e| format!("certificate verifier: {e}"))
}

impl Probe for TlsCertificateProbe {
    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn check(&self, _timeout: Duration) -> ProbeFuture<'_> {
        Box::pin(async move {
            match self.inspect().await {
                Ok(outcome) => outcome,
                Err(message) => {
                    debug!(probe = %self.spec.name, host = %self.host, error = %message, "tls probe failed");
                    ProbeOutcome::unhealthy(message)
                }
            }
        })
    }
}
