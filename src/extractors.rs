//! Pulling values out of a response.
//!
//! Every extractor field (regex pattern, `json_path`, selector) has two forms.
//! The plain form records each match on its own. The placeholder form, e.g.
//! `json_path: "version: {version}"`, treats every `{inner}` span as its own
//! query and substitutes the result back into the surrounding text.

use crate::template::{Extractor, ResponseInfo};
use crate::xpath::XPathQuery;
use crate::{Result, ScanError};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

static INNER_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(.*?)\}").expect("inner placeholder pattern"));

/// Run `extractors` against `response` and join the non-empty fragments.
///
/// A separator containing a newline is also emitted before the first
/// fragment, so multi-line output starts on its own line.
pub fn extract(response: &ResponseInfo, extractors: &[Extractor], separator: &str) -> Option<String> {
    let mut fragments = Vec::new();

    for extractor in extractors {
        match run_extractor(response, extractor) {
            Ok(values) => fragments.extend(values.into_iter().filter(|v| !v.is_empty())),
            Err(e) => warn!("Extractor '{}' failed: {}", extractor.extractor_type, e),
        }
    }

    if fragments.is_empty() {
        return None;
    }

    let separator = expand_separator(separator);
    let prefix = if separator.contains('\n') { separator.as_str() } else { "" };
    Some(format!("{}{}", prefix, fragments.join(separator.as_str())))
}

/// Expand `\n`, `\t` and `\r` escape sequences written literally in a rule.
pub fn expand_separator(separator: &str) -> String {
    separator
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\r", "\r")
}

fn has_placeholder(text: &str) -> bool {
    text.contains('{') && text.contains('}')
}

/// `(span, inner)` pairs for every `{inner}` in `text`.
fn placeholders(text: &str) -> Vec<(String, String)> {
    INNER_PLACEHOLDER
        .captures_iter(text)
        .filter_map(|c| Some((c.get(0)?.as_str().to_string(), c.get(1)?.as_str().to_string())))
        .collect()
}

pub fn run_extractor(response: &ResponseInfo, extractor: &Extractor) -> Result<Vec<String>> {
    match extractor.extractor_type.as_str() {
        "regex" => extract_regex(response, extractor),
        "json" => extract_json(&response.body, &extractor.json_path).map(|v| vec![v]),
        "xpath" => {
            let document = Html::parse_document(&response.body);
            select_all(&extractor.selector, |query| {
                Ok(XPathQuery::parse(query)?.select(&document))
            })
        }
        "html" => {
            let document = Html::parse_document(&response.body);
            select_all(&extractor.selector, |query| {
                let selector = Selector::parse(query)
                    .map_err(|e| ScanError::InvalidInput(format!("invalid css selector '{}': {:?}", query, e)))?;
                Ok(document
                    .select(&selector)
                    .map(|element| element.text().collect::<String>().trim().to_string())
                    .collect())
            })
        }
        other => Err(ScanError::InvalidInput(format!("unknown extractor type: {}", other))),
    }
}

fn extract_regex(response: &ResponseInfo, extractor: &Extractor) -> Result<Vec<String>> {
    let haystacks: Vec<&str> = match extractor.part.as_str() {
        "body" => vec![response.body.as_str()],
        "header" => response.header_values().collect(),
        other => return Err(ScanError::InvalidInput(format!("unknown response part: {}", other))),
    };

    let mut values = Vec::new();
    for pattern in &extractor.regex {
        if has_placeholder(pattern) {
            let inner: Vec<(String, Regex)> = placeholders(pattern)
                .into_iter()
                .map(|(span, inner)| compile(&inner).map(|re| (span, re)))
                .collect::<Result<_>>()?;

            for haystack in &haystacks {
                let mut rendered = pattern.clone();
                let mut found = false;
                for (span, re) in &inner {
                    if let Some(value) = capture(re, haystack, extractor.group) {
                        rendered = rendered.replace(span, value);
                        found = true;
                    }
                }
                if found {
                    values.push(rendered);
                }
            }
        } else {
            let re = compile(pattern)?;
            values.extend(
                haystacks
                    .iter()
                    .filter_map(|haystack| capture(&re, haystack, extractor.group))
                    .map(str::to_string),
            );
        }
    }
    Ok(values)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ScanError::InvalidInput(format!("invalid regex '{}': {}", pattern, e)))
}

fn capture<'h>(re: &Regex, haystack: &'h str, group: usize) -> Option<&'h str> {
    re.captures(haystack)?.get(group).map(|m| m.as_str())
}

fn extract_json(body: &str, path: &str) -> Result<String> {
    let document: serde_json::Value = serde_json::from_str(body)?;

    if !has_placeholder(path) {
        return walk_json(&document, path).map(json_value_to_string);
    }

    let mut rendered = path.to_string();
    for (span, inner) in placeholders(path) {
        let value = walk_json(&document, &inner)?;
        rendered = rendered.replace(&span, &json_value_to_string(value));
    }
    Ok(rendered)
}

/// Follow a dot path; numeric segments index into arrays.
pub fn walk_json<'a>(value: &'a serde_json::Value, path: &str) -> Result<&'a serde_json::Value> {
    let mut current = value;
    for key in path.split('.') {
        current = match current {
            serde_json::Value::Array(items) => {
                let index: usize = key
                    .parse()
                    .map_err(|_| ScanError::InvalidInput(format!("json index '{}' is not a number", key)))?;
                items.get(index)
            }
            serde_json::Value::Object(map) => map.get(key),
            _ => None,
        }
        .ok_or_else(|| ScanError::InvalidInput(format!("json path '{}' not found at '{}'", path, key)))?;
    }
    Ok(current)
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}

/// Shared plain/placeholder handling for the document selectors. The
/// placeholder form substitutes the first match, or nothing.
fn select_all<F>(selector: &str, query: F) -> Result<Vec<String>>
where
    F: Fn(&str) -> Result<Vec<String>>,
{
    if !has_placeholder(selector) {
        return query(selector);
    }

    let mut rendered = selector.to_string();
    for (span, inner) in placeholders(selector) {
        let first = query(&inner)?.into_iter().next().unwrap_or_default();
        rendered = rendered.replace(&span, &first);
    }
    Ok(vec![rendered])
}
