//! Rule documents: the YAML format that drives the matching engine.
//!
//! A rule is kept in two forms. [`RuleTemplate`] holds the raw document as
//! loaded, placeholders and all, plus the header fields needed before
//! resolution (`id`, `info`, `options`). [`Rule`] is the typed view produced
//! after the placeholders of one invocation have been resolved.

use crate::{Result, ScanError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Technology fingerprints compiled into the binary.
const BUILTIN_TECHNOLOGIES: &[(&str, &str)] = &[
    ("apache.yaml", include_str!("../data/technologies/apache.yaml")),
    ("nginx.yaml", include_str!("../data/technologies/nginx.yaml")),
    ("iis.yaml", include_str!("../data/technologies/iis.yaml")),
    ("php.yaml", include_str!("../data/technologies/php.yaml")),
    ("wordpress.yaml", include_str!("../data/technologies/wordpress.yaml")),
    ("jquery.yaml", include_str!("../data/technologies/jquery.yaml")),
    ("proxmox.yaml", include_str!("../data/technologies/proxmox.yaml")),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleInfo {
    #[serde(default)]
    pub name: String,
    /// Category shown next to a match, e.g. `web-server`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleOption {
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    #[serde(default)]
    pub required: bool,
}

impl RuleOption {
    /// Default value rendered the way it is substituted into placeholders.
    pub fn default_text(&self) -> Option<String> {
        match self.default.as_ref()? {
            serde_yaml::Value::Null => None,
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            other => serde_yaml::to_string(other).ok().map(|s| s.trim_end().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl Default for RequestSpec {
    fn default() -> Self {
        Self::get(&default_path())
    }
}

impl RequestSpec {
    pub fn get(path: &str) -> Self {
        Self::with_method("GET", path)
    }

    pub fn with_method(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(rename = "type")]
    pub matcher_type: String,
    #[serde(default = "default_part")]
    pub part: String,
    #[serde(default = "default_or")]
    pub condition: String,
    #[serde(default)]
    pub status: Vec<u16>,
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default)]
    pub regex: Vec<String>,
    #[serde(default)]
    pub dsl: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extractor {
    #[serde(rename = "type")]
    pub extractor_type: String,
    #[serde(default = "default_part")]
    pub part: String,
    #[serde(default)]
    pub regex: Vec<String>,
    #[serde(default)]
    pub json_path: String,
    /// XPath expression or CSS selector, depending on the type.
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub group: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchBlock {
    #[serde(rename = "matchers-condition", default = "default_and")]
    pub matchers_condition: String,
    #[serde(rename = "stop-at-first-match", default)]
    pub stop_at_first_match: bool,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
    #[serde(rename = "extract-separator", default = "default_separator")]
    pub extract_separator: String,
}

/// A rule with every placeholder of one invocation resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub info: RuleInfo,
    #[serde(default)]
    pub options: BTreeMap<String, RuleOption>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub request: RequestSpec,
    #[serde(rename = "match", default)]
    pub match_blocks: Vec<MatchBlock>,
}

#[derive(Debug, Deserialize)]
struct RuleHeader {
    id: String,
    #[serde(default)]
    info: RuleInfo,
    #[serde(default)]
    options: BTreeMap<String, RuleOption>,
}

/// A loaded, unresolved rule document.
#[derive(Debug, Clone)]
pub struct RuleTemplate {
    pub id: String,
    pub info: RuleInfo,
    pub options: BTreeMap<String, RuleOption>,
    document: serde_yaml::Value,
    source: Option<PathBuf>,
}

impl RuleTemplate {
    /// Parse and validate a rule document.
    ///
    /// The document is checked against [`Rule`] before any placeholder is
    /// resolved, so `{{...}}` may only appear where a string is expected.
    /// Numeric and boolean fields (`status`, `group`, `debug`, ...) must be
    /// literal.
    pub fn from_yaml(yaml_content: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml_content)?;
        let header: RuleHeader = serde_yaml::from_value(document.clone())?;

        if header.id.trim().is_empty() {
            return Err(ScanError::InvalidInput("rule id must not be empty".to_string()));
        }

        // Catch structural mistakes at load time rather than mid-scan.
        serde_yaml::from_value::<Rule>(document.clone()).map_err(|e| {
            ScanError::InvalidInput(format!(
                "rule {}: {} (placeholders are only allowed in string fields)",
                header.id, e
            ))
        })?;

        Ok(Self {
            id: header.id,
            info: header.info,
            options: header.options,
            document,
            source: None,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScanError::InvalidInput(format!("cannot read rule file {}: {}", path.display(), e))
        })?;
        let mut template = Self::from_yaml(&content).map_err(|e| {
            ScanError::InvalidInput(format!("invalid rule file {}: {}", path.display(), e))
        })?;
        template.source = Some(path.to_path_buf());
        Ok(template)
    }

    /// Every `.yaml`/`.yml` file below `dir`, except `example.yaml`.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        let mut files = Vec::new();
        collect_rule_files(dir, &mut files)?;
        files.sort();

        let mut templates = Vec::new();
        for file in files {
            match Self::from_file(&file) {
                Ok(template) => {
                    debug!("Loaded rule {} from {}", template.id, file.display());
                    templates.push(template);
                }
                Err(e) => warn!("Skipping rule: {}", e),
            }
        }
        Ok(templates)
    }

    pub fn builtin_technologies() -> Result<Vec<Self>> {
        BUILTIN_TECHNOLOGIES
            .iter()
            .map(|(name, content)| {
                Self::from_yaml(content)
                    .map_err(|e| ScanError::InvalidInput(format!("builtin rule {}: {}", name, e)))
            })
            .collect()
    }

    pub fn document(&self) -> &serde_yaml::Value {
        &self.document
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn required_options(&self) -> impl Iterator<Item = &str> {
        self.options
            .iter()
            .filter(|(_, option)| option.required)
            .map(|(name, _)| name.as_str())
    }
}

fn collect_rule_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ScanError::InvalidInput(format!("cannot read rules directory {}: {}", dir.display(), e))
    })?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_rule_files(&path, files)?;
            continue;
        }
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let is_example = path.file_name().and_then(|n| n.to_str()) == Some("example.yaml");
        if is_yaml && !is_example {
            files.push(path);
        }
    }
    Ok(())
}

/// The response a rule is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub status_code: u16,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ResponseInfo {
    pub fn new(status_code: u16, headers: Vec<(String, String)>, body: impl Into<String>) -> Self {
        Self {
            status_code,
            headers,
            body: body.into(),
        }
    }

    pub fn header_values(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(|(_, value)| value.as_str())
    }

    /// `Name: value` lines joined with `\n`.
    pub fn header_text(&self) -> String {
        self.headers
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_part() -> String {
    "body".to_string()
}

fn default_or() -> String {
    "or".to_string()
}

fn default_and() -> String {
    "and".to_string()
}

fn default_separator() -> String {
    " | ".to_string()
}
