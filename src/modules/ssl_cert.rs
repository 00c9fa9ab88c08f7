use super::{DetectionModule, ModuleOptions, ModuleOutput};
use crate::{Result, ScanError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use x509_parser::prelude::*;

const NOT_AVAILABLE: &str = "N/A";

/// Fields of an X.509 distinguished name shown in the report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameFields {
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub organization: Option<String>,
    pub common_name: Option<String>,
}

impl NameFields {
    fn from_name(name: &X509Name<'_>) -> Self {
        fn first<'a, 'b: 'a>(mut values: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>) -> Option<String> {
            values.next().and_then(|v| v.as_str().ok()).map(str::to_string)
        }

        Self {
            country: first(name.iter_country()),
            state: first(name.iter_state_or_province()),
            locality: first(name.iter_locality()),
            organization: first(name.iter_organization()),
            common_name: first(name.iter_common_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub subject: NameFields,
    pub issuer: NameFields,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateSummary {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| ScanError::Tls(format!("invalid certificate: {}", e)))?;

        let validity = cert.validity();
        Ok(Self {
            subject: NameFields::from_name(cert.subject()),
            issuer: NameFields::from_name(cert.issuer()),
            serial: cert.tbs_certificate.serial.to_string(),
            not_before: timestamp(validity.not_before.timestamp())?,
            not_after: timestamp(validity.not_after.timestamp())?,
        })
    }

    /// Whole days from `now` until the certificate expires; negative once expired.
    pub fn days_until_expiration(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    pub fn render(&self, now: DateTime<Utc>) -> Vec<String> {
        fn field(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or(NOT_AVAILABLE)
        }
        const DATE: &str = "%Y-%m-%d %H:%M:%S";

        vec![
            "Certificate Subject:".to_string(),
            format!("- Country        : {}", field(&self.subject.country)),
            format!("- State/Province : {}", field(&self.subject.state)),
            format!("- Locality       : {}", field(&self.subject.locality)),
            format!("- Organization   : {}", field(&self.subject.organization)),
            format!("- Common Name    : {}", field(&self.subject.common_name)),
            "Certificate Issuer:".to_string(),
            format!("- Country        : {}", field(&self.issuer.country)),
            format!("- Organization   : {}", field(&self.issuer.organization)),
            format!("- Common Name    : {}", field(&self.issuer.common_name)),
            format!("Serial Number    : {}", self.serial),
            format!("Valid From       : {}", self.not_before.format(DATE)),
            format!("Valid To         : {}", self.not_after.format(DATE)),
            format!("Days Expiration  : {} days", self.days_until_expiration(now)),
        ]
    }
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| ScanError::Tls(format!("certificate time out of range: {}", seconds)))
}

/// Leaf certificate of a TLS service. Verification is disabled: the point
/// is to read whatever the server presents.
pub struct SslCert {
    timeout: Duration,
}

impl SslCert {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn fetch(&self, ip: IpAddr, port: u16) -> Result<CertificateSummary> {
        let addr = SocketAddr::new(ip, port);
        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ScanError::Timeout {
                operation: format!("connect to {}", addr),
            })??;

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .use_sni(false)
            .build()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tls_stream = timeout(self.timeout, connector.connect(&ip.to_string(), stream))
            .await
            .map_err(|_| ScanError::Timeout {
                operation: format!("TLS handshake with {}", addr),
            })??;

        let certificate = tls_stream
            .get_ref()
            .peer_certificate()?
            .ok_or_else(|| ScanError::Tls("server presented no certificate".to_string()))?;

        CertificateSummary::from_der(&certificate.to_der()?)
    }
}

#[async_trait]
impl DetectionModule for SslCert {
    fn name(&self) -> &str {
        "ssl-cert"
    }

    fn portrule(&self) -> &[&str] {
        &["https"]
    }

    fn description(&self) -> &str {
        "Get SSL certificate details"
    }

    async fn run(&self, ip: IpAddr, port: u16, _options: &ModuleOptions) -> Result<ModuleOutput> {
        let summary = self.fetch(ip, port).await?;
        Ok(ModuleOutput::Lines(summary.render(Utc::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEM: &[u8] = include_bytes!("../../tests/data/selfsigned.pem");

    fn summary() -> CertificateSummary {
        let (_, pem) = x509_parser::pem::parse_x509_pem(PEM).unwrap();
        CertificateSummary::from_der(&pem.contents).unwrap()
    }

    #[test]
    fn test_summary_fields() {
        let summary = summary();
        assert_eq!(summary.subject.common_name.as_deref(), Some("scanme.local"));
        assert_eq!(summary.subject.state.as_deref(), Some("Jawa Barat"));
        assert_eq!(summary.issuer.organization.as_deref(), Some("Betascan Test"));
        assert_eq!(summary.serial, "4660");
    }

    #[test]
    fn test_render_counts_days_until_expiry() {
        let summary = summary();
        let now = summary.not_after - chrono::Duration::days(30);
        let lines = summary.render(now);

        assert_eq!(lines[0], "Certificate Subject:");
        assert!(lines.contains(&"- Common Name    : scanme.local".to_string()));
        assert!(lines.contains(&"Valid To         : 2126-09-23 15:42:23".to_string()));
        assert_eq!(lines.last().unwrap(), "Days Expiration  : 30 days");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(CertificateSummary::from_der(b"not a certificate").is_err());
    }
}
