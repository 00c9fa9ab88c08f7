use super::{option_enabled, DetectionModule, ModuleOptions, ModuleOutput};
use crate::template::{RequestSpec, ResponseInfo};
use crate::template_engine::RequestIssuer;
use crate::{Result, ScanError};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::net::IpAddr;
use std::sync::Arc;

const WEB_PORTRULE: &[&str] = &["http", "https", "proxmox"];

fn request_path(options: &ModuleOptions) -> &str {
    options.get("path").map(String::as_str).unwrap_or("/")
}

fn require_ok(response: &ResponseInfo, what: &str) -> Result<()> {
    if response.status_code == 200 {
        Ok(())
    } else {
        Err(ScanError::Module(format!(
            "Failed to retrieve {}, status code: {}",
            what, response.status_code
        )))
    }
}

pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|title| !title.is_empty())
}

/// Page `<title>` of the service root (or `path`).
pub struct HttpTitle {
    issuer: Arc<dyn RequestIssuer>,
}

impl HttpTitle {
    pub fn new(issuer: Arc<dyn RequestIssuer>) -> Self {
        Self { issuer }
    }
}

#[async_trait]
impl DetectionModule for HttpTitle {
    fn name(&self) -> &str {
        "http-title"
    }

    fn portrule(&self) -> &[&str] {
        WEB_PORTRULE
    }

    fn description(&self) -> &str {
        "Get HTTP title"
    }

    async fn run(&self, ip: IpAddr, port: u16, options: &ModuleOptions) -> Result<ModuleOutput> {
        let request = RequestSpec::get(request_path(options));
        let response = self.issuer.issue(ip, port, &request).await?;
        require_ok(&response, "content")?;

        let title = extract_title(&response.body).unwrap_or_else(|| "No title found".to_string());
        Ok(ModuleOutput::Line(format!("Title: {}\n(Request type: GET)", title)))
    }
}

/// Response headers, fetched with HEAD unless `useget` is set.
pub struct HttpHeaders {
    issuer: Arc<dyn RequestIssuer>,
}

impl HttpHeaders {
    pub fn new(issuer: Arc<dyn RequestIssuer>) -> Self {
        Self { issuer }
    }
}

#[async_trait]
impl DetectionModule for HttpHeaders {
    fn name(&self) -> &str {
        "http-headers"
    }

    fn portrule(&self) -> &[&str] {
        WEB_PORTRULE
    }

    fn description(&self) -> &str {
        "Get HTTP headers"
    }

    async fn run(&self, ip: IpAddr, port: u16, options: &ModuleOptions) -> Result<ModuleOutput> {
        let method = if option_enabled(options, "useget") { "GET" } else { "HEAD" };
        let request = RequestSpec::with_method(method, request_path(options));
        let response = self.issuer.issue(ip, port, &request).await?;
        require_ok(&response, "headers")?;

        let mut output = response.header_text();
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&format!("(Request type: {})", method));
        Ok(ModuleOutput::Line(output))
    }
}
