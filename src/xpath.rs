//! A small XPath subset evaluated with the CSS selector engine.
//!
//! Supported: `/a/b` and `//a` element steps, `*`, `.//` relative prefixes,
//! predicates `[@attr]`, `[@attr='v']`, `[contains(@attr,'v')]` and `[n]`,
//! and a final `text()` or `@attr` step.

use crate::{Result, ScanError};
use scraper::{Html, Selector};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    Text,
    Attribute(String),
}

#[derive(Debug, Clone)]
pub struct XPathQuery {
    css: String,
    output: Output,
    selector: Selector,
}

impl XPathQuery {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let mut rest = expression.strip_prefix('.').unwrap_or(expression);
        if !rest.starts_with('/') {
            return Err(unsupported(expression, "path must start with '/' or './/'"));
        }

        let mut css = String::new();
        let mut output = Output::Text;
        let mut first = true;

        while !rest.is_empty() {
            let descendant = rest.starts_with("//");
            rest = rest.trim_start_matches('/');
            let (step, remainder) = split_step(rest);
            rest = remainder;

            if step.is_empty() {
                return Err(unsupported(expression, "empty step"));
            }
            if step == "text()" || step.starts_with('@') {
                if !rest.is_empty() {
                    return Err(unsupported(expression, "text() and @attr must be the last step"));
                }
                if css.is_empty() {
                    return Err(unsupported(expression, "no element step"));
                }
                if let Some(attr) = step.strip_prefix('@') {
                    output = Output::Attribute(attr.to_string());
                }
                break;
            }

            let compound = translate_step(step, expression)?;
            if first {
                css.push_str(&compound);
                if !descendant {
                    css.push_str(":root");
                }
                first = false;
            } else {
                css.push_str(if descendant { " " } else { " > " });
                css.push_str(&compound);
            }
        }

        let selector = Selector::parse(&css)
            .map_err(|e| ScanError::InvalidInput(format!("xpath '{}' -> css '{}': {:?}", expression, css, e)))?;

        Ok(Self { css, output, selector })
    }

    pub fn css(&self) -> &str {
        &self.css
    }

    /// Trimmed text (or attribute value) of every matched element.
    pub fn select(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.selector)
            .filter_map(|element| match &self.output {
                Output::Text => Some(element.text().collect::<String>().trim().to_string()),
                Output::Attribute(name) => element.value().attr(name).map(|v| v.trim().to_string()),
            })
            .collect()
    }
}

fn unsupported(expression: &str, reason: &str) -> ScanError {
    ScanError::InvalidInput(format!("unsupported xpath '{}': {}", expression, reason))
}

/// Split off the first step, honoring brackets and quotes.
fn split_step(path: &str) -> (&str, &str) {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, ch) in path.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, '/') if depth == 0 => return (&path[..i], &path[i..]),
            _ => {}
        }
    }
    (path, "")
}

fn translate_step(step: &str, expression: &str) -> Result<String> {
    let (name, mut predicates) = match step.find('[') {
        Some(pos) => (&step[..pos], &step[pos..]),
        None => (step, ""),
    };

    if name != "*" && !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(unsupported(expression, &format!("unsupported step '{}'", step)));
    }

    let mut css = name.to_string();
    while !predicates.is_empty() {
        let end = predicates
            .find(']')
            .ok_or_else(|| unsupported(expression, "unclosed predicate"))?;
        let predicate = predicates[1..end].trim();
        predicates = &predicates[end + 1..];
        css.push_str(&translate_predicate(name, predicate, expression)?);
    }
    Ok(css)
}

fn translate_predicate(name: &str, predicate: &str, expression: &str) -> Result<String> {
    if let Ok(position) = predicate.parse::<usize>() {
        return Ok(if name == "*" {
            format!(":nth-child({})", position)
        } else {
            format!(":nth-of-type({})", position)
        });
    }

    if let Some(args) = predicate
        .strip_prefix("contains(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let (attr, value) = args
            .split_once(',')
            .ok_or_else(|| unsupported(expression, "contains() needs two arguments"))?;
        let attr = attr
            .trim()
            .strip_prefix('@')
            .ok_or_else(|| unsupported(expression, "contains() first argument must be @attr"))?;
        return Ok(format!("[{}*=\"{}\"]", attr, unquote(value.trim())));
    }

    if let Some(attr) = predicate.strip_prefix('@') {
        return Ok(match attr.split_once('=') {
            Some((attr, value)) => format!("[{}=\"{}\"]", attr.trim(), unquote(value.trim())),
            None => format!("[{}]", attr.trim()),
        });
    }

    Err(unsupported(expression, &format!("unsupported predicate '[{}]'", predicate)))
}

fn unquote(value: &str) -> String {
    value
        .trim_matches(|c| c == '\'' || c == '"')
        .replace('"', "\\\"")
}
