use anyhow::{anyhow, Context, Result};
use regex::Regex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const LETS_ENCRYPT_ORG: &str = "Let's Encrypt";

/// Observed TLS state of one router's hostname.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsStatus {
    /// Serving a Let's Encrypt certificate; ACME completed.
    Valid,
    /// Reachable but serving some other (typically the proxy's default)
    /// certificate.
    Pending,
    /// Unreachable, handshake failure or disabled router.
    Error,
    /// Router has no TLS configured.
    None,
}

#[derive(Debug, Deserialize)]
struct AdminRouter {
    name: String,
    rule: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    tls: Option<serde_json::Value>,
}

/// Query the proxy admin API for all routers and probe each router's Host
/// literal over a real TLS connection. The served certificate's issuer is
/// the only authoritative signal that ACME completed.
pub async fn router_tls_status(admin_url: &str) -> Result<BTreeMap<String, TlsStatus>> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .context("failed to build admin API client")?;
    let routers: Vec<AdminRouter> = client
        .get(format!("{}/api/http/routers", admin_url))
        .send()
        .await
        .context("proxy admin API unreachable")?
        .error_for_status()
        .context("proxy admin API returned an error")?
        .json()
        .await
        .context("unparseable router list from proxy admin API")?;

    let probes = routers.into_iter().filter_map(|router| {
        let host = host_literal(&router.rule)?;
        Some(async move {
            let status = classify(&router, &host).await;
            (router.name, status)
        })
    });

    Ok(futures::future::join_all(probes).await.into_iter().collect())
}

async fn classify(router: &AdminRouter, host: &str) -> TlsStatus {
    if router.tls.is_none() {
        return TlsStatus::None;
    }
    if router.status.as_deref() == Some("disabled") {
        return TlsStatus::Error;
    }
    match tokio::time::timeout(PROBE_TIMEOUT, issuer_organization(host)).await {
        Ok(Ok(Some(org))) if org == LETS_ENCRYPT_ORG => TlsStatus::Valid,
        Ok(Ok(_)) => TlsStatus::Pending,
        Ok(Err(e)) => {
            debug!("TLS probe of {} failed: {}", host, e);
            TlsStatus::Error
        }
        Err(_) => {
            debug!("TLS probe of {} timed out", host);
            TlsStatus::Error
        }
    }
}

/// First Host literal of a router rule, if any. Regexp-based rules (the
/// OAuth catch-all) have no single hostname to probe.
pub fn host_literal(rule: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"Host\(`([^`]+)`\)").unwrap());
    pattern
        .captures(rule)
        .map(|captures| captures[1].to_string())
}

/// Open a TLS connection to `host:443` and return the served certificate's
/// issuer organization. Verification is disabled on purpose: the point is
/// to inspect whatever certificate is being served, default self-signed
/// ones included.
async fn issuer_organization(host: &str) -> Result<Option<String>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("failed to build TLS client config")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect((host, 443))
        .await
        .with_context(|| format!("failed to connect to {}:443", host))?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| anyhow!("invalid server name '{}'", host))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {} failed", host))?;

    let (_, connection) = stream.get_ref();
    let certificate = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .context("no peer certificate presented")?;

    let (_, parsed) = x509_parser::parse_x509_certificate(certificate.as_ref())
        .map_err(|e| anyhow!("failed to parse peer certificate: {}", e))?;
    let organization = parsed
        .issuer()
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    Ok(organization)
}

/// Accepts every certificate; see `issuer_organization`.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
