//! Rule execution.
//!
//! The engine resolves a rule's placeholders once per invocation, has a
//! [`RequestIssuer`] send the resolved request, then walks the match blocks
//! against the single response.

use crate::extractors;
use crate::matchers;
use crate::resolver::{self, EvaluationContext};
use crate::template::{RequestSpec, ResponseInfo, Rule, RuleTemplate};
use crate::{Result, ScanError};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Sends one HTTP request to `ip:port` and returns the collected response.
#[async_trait]
pub trait RequestIssuer: Send + Sync {
    async fn issue(&self, ip: IpAddr, port: u16, request: &RequestSpec) -> Result<ResponseInfo>;
}

/// [`RequestIssuer`] backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpIssuer {
    client: Client,
}

impl HttpIssuer {
    pub fn new() -> Result<Self> {
        Self::with_config(Duration::from_secs(10), 10, false, default_user_agent())
    }

    pub fn with_config(
        timeout: Duration,
        max_redirects: u32,
        verify_ssl: bool,
        user_agent: String,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl)
            .redirect(reqwest::redirect::Policy::limited(max_redirects as usize))
            .user_agent(&user_agent)
            .build()?;

        Ok(Self { client })
    }

    /// `https` on 443, `http` otherwise. IPv6 hosts are bracketed.
    pub fn url_for(ip: IpAddr, port: u16, path: &str) -> String {
        let scheme = if port == 443 { "https" } else { "http" };
        let host = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("{}://{}:{}{}", scheme, host, port, path)
    }
}

pub fn default_user_agent() -> String {
    format!("betascan/{}", env!("CARGO_PKG_VERSION"))
}

#[async_trait]
impl RequestIssuer for HttpIssuer {
    async fn issue(&self, ip: IpAddr, port: u16, request: &RequestSpec) -> Result<ResponseInfo> {
        let url = Self::url_for(ip, port, &request.path);
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ScanError::InvalidInput(format!("invalid HTTP method '{}': {}", request.method, e)))?;

        let mut builder = self.client.request(method, &url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        debug!("{} {}", request.method, url);
        let response = builder.send().await?;

        let status_code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect();
        let body = response.text().await?;

        Ok(ResponseInfo::new(status_code, headers, body))
    }
}

/// Result of one match block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: bool,
    pub extracted: Option<String>,
}

#[derive(Clone)]
pub struct TemplateEngine {
    issuer: Arc<dyn RequestIssuer>,
}

impl TemplateEngine {
    pub fn new(issuer: Arc<dyn RequestIssuer>) -> Self {
        Self { issuer }
    }

    pub fn issuer(&self) -> Arc<dyn RequestIssuer> {
        Arc::clone(&self.issuer)
    }

    /// Walk the match blocks of an already resolved rule.
    ///
    /// Extractors run whether or not the block matched. With
    /// `stop-at-first-match`, the first matching block ends the walk.
    pub fn evaluate(rule: &Rule, response: &ResponseInfo) -> Result<Vec<MatchOutcome>> {
        let mut outcomes = Vec::with_capacity(rule.match_blocks.len());

        for block in &rule.match_blocks {
            let matched = matchers::matches(response, &block.matchers, &block.matchers_condition)?;
            let extracted = extractors::extract(response, &block.extractors, &block.extract_separator);
            outcomes.push(MatchOutcome { matched, extracted });

            if block.stop_at_first_match && matched {
                break;
            }
        }

        if rule.debug && !outcomes.is_empty() {
            info!("[{}] {:?}", rule.id, outcomes);
        }
        Ok(outcomes)
    }

    /// Resolve `template` against `options`, issue its request to
    /// `ip:port` and evaluate the response.
    ///
    /// Required options are checked before anything is sent.
    pub async fn run(
        &self,
        template: &RuleTemplate,
        ip: IpAddr,
        port: u16,
        options: &HashMap<String, String>,
    ) -> Result<Vec<MatchOutcome>> {
        let mut context = EvaluationContext::with_options(options);
        let rule = resolver::resolve_rule(template, &mut context)?;
        let response = self.issuer.issue(ip, port, &rule.request).await?;
        Self::evaluate(&rule, &response)
    }

    /// Same as [`run`](Self::run) against a response fetched elsewhere.
    pub fn run_on_response(
        template: &RuleTemplate,
        response: &ResponseInfo,
        options: &HashMap<String, String>,
    ) -> Result<Vec<MatchOutcome>> {
        let mut context = EvaluationContext::with_options(options);
        let rule = resolver::resolve_rule(template, &mut context)?;
        Self::evaluate(&rule, response)
    }
}
