//! TCP port probing and banner grabbing.

use crate::{Result, ScanError};
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Raw banners longer than this are cut when text limiting is on.
pub const BANNER_LIMIT: usize = 100;

const MAX_BANNER_BYTES: usize = 64 * 1024;

static TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<title>(.*?)</title>").expect("title pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPort {
    pub port: u16,
    pub banner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PortProber {
    timeout: Duration,
    grab_banner: bool,
    limit_text: bool,
}

impl PortProber {
    pub fn new(timeout: Duration, grab_banner: bool, limit_text: bool) -> Self {
        Self {
            timeout,
            grab_banner,
            limit_text,
        }
    }

    /// `None` when the port is closed, refused or filtered.
    pub async fn probe(&self, ip: IpAddr, port: u16) -> Option<OpenPort> {
        let addr = SocketAddr::new(ip, port);

        let stream = match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                trace!("{} closed: {}", addr, e);
                return None;
            }
            Err(_) => {
                trace!("{} timed out", addr);
                return None;
            }
        };
        debug!("TCP Port {}:{} is open", ip, port);

        let banner = if self.grab_banner {
            match self.grab(stream, ip, port).await {
                Ok(raw) => describe_response(&String::from_utf8_lossy(&raw), self.limit_text),
                Err(e) => Some(format!("Error: {}", e)),
            }
        } else {
            None
        };

        Some(OpenPort { port, banner })
    }

    /// Send a plain `GET /` (over TLS on 443) and collect the reply.
    async fn grab(&self, stream: TcpStream, ip: IpAddr, port: u16) -> Result<Vec<u8>> {
        if port == 443 {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let mut tls_stream = timeout(self.timeout, connector.connect(&ip.to_string(), stream))
                .await
                .map_err(|_| ScanError::Timeout {
                    operation: "TLS handshake".to_string(),
                })??;
            self.exchange(&mut tls_stream, ip).await
        } else {
            let mut stream = stream;
            self.exchange(&mut stream, ip).await
        }
    }

    async fn exchange<S>(&self, stream: &mut S, ip: IpAddr) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", ip);
        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        let mut buffer = [0u8; 1024];
        while response.len() < MAX_BANNER_BYTES {
            match timeout(self.timeout, stream.read(&mut buffer)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => response.extend_from_slice(&buffer[..n]),
                Ok(Err(e)) if response.is_empty() => return Err(e.into()),
                // Keep what arrived before a reset or a silent peer.
                Ok(Err(_)) | Err(_) => break,
            }
        }
        Ok(response)
    }
}

/// Reduce a raw reply to one descriptive line.
///
/// Preference: `Redirect to: ...` or the page title, with the `Server:`
/// header appended; then an `SSH-` identification line; then the bare
/// title; then the raw text.
pub fn describe_response(raw: &str, limit_text: bool) -> Option<String> {
    let head = raw.split("\r\n\r\n").next().unwrap_or_default();
    let headers: Vec<&str> = head.split("\r\n").collect();

    let mut title = TITLE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let is_redirect = headers
        .first()
        .and_then(|status| status.split_whitespace().nth(1))
        .map_or(false, |code| code.starts_with('3'));
    if is_redirect {
        if let Some(location) = headers
            .iter()
            .find_map(|line| strip_prefix_ignore_case(line, "location:"))
        {
            title = format!("Redirect to: {}", location.trim());
        }
    }

    if let Some(server) = headers.iter().find(|line| line.starts_with("Server:")) {
        return Some(format!("{} [{}]", title, server).trim_start().to_string());
    }
    if let Some(ssh) = headers.iter().find(|line| line.starts_with("SSH")) {
        return Some(ssh.replace('\n', " | ").trim_end().to_string());
    }
    if !title.is_empty() {
        return Some(title);
    }

    let text = format_response(raw, limit_text);
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &line[prefix.len()..])
}

/// Collapse whitespace and cut to [`BANNER_LIMIT`] characters plus `...`.
/// Without `limit_text` the text is returned untouched.
pub fn format_response(raw: &str, limit_text: bool) -> String {
    if !limit_text {
        return raw.to_string();
    }

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > BANNER_LIMIT {
        let cut: String = collapsed.chars().take(BANNER_LIMIT).collect();
        format!("{}...", cut)
    } else {
        collapsed
    }
}
