use crate::dsl::DslContext;
use crate::template::{Matcher, ResponseInfo};
use crate::{Result, ScanError};
use log::warn;
use regex::Regex;

/// Combine booleans under `and`/`or`. Any other condition is a configuration error.
pub fn combine(results: &[bool], condition: &str) -> Result<bool> {
    match condition.to_ascii_lowercase().as_str() {
        "and" => Ok(results.iter().all(|matched| *matched)),
        "or" => Ok(results.iter().any(|matched| *matched)),
        other => Err(ScanError::UnsupportedCondition(other.to_string())),
    }
}

/// Evaluate `matchers` against `response` and combine them with `condition`.
///
/// A matcher that fails internally (bad regex, unknown type, ...) is logged
/// and counts as `false`; only an unsupported `condition` is an error.
pub fn matches(response: &ResponseInfo, matchers: &[Matcher], condition: &str) -> Result<bool> {
    let results: Vec<bool> = matchers
        .iter()
        .map(|matcher| {
            evaluate_matcher(response, matcher).unwrap_or_else(|e| {
                warn!("Matcher '{}' failed: {}", matcher.matcher_type, e);
                false
            })
        })
        .collect();

    combine(&results, condition)
}

pub fn evaluate_matcher(response: &ResponseInfo, matcher: &Matcher) -> Result<bool> {
    match matcher.matcher_type.as_str() {
        "status" => Ok(matcher.status.contains(&response.status_code)),
        "word" => {
            let results: Vec<bool> = match matcher.part.as_str() {
                "header" => matcher
                    .words
                    .iter()
                    .map(|word| response.header_values().any(|value| value.contains(word.as_str())))
                    .collect(),
                "body" => matcher
                    .words
                    .iter()
                    .map(|word| response.body.contains(word.as_str()))
                    .collect(),
                other => return Err(unknown_part(other)),
            };
            combine(&results, &matcher.condition)
        }
        "regex" => {
            let mut results = Vec::with_capacity(matcher.regex.len());
            for pattern in &matcher.regex {
                let re = Regex::new(pattern)
                    .map_err(|e| ScanError::InvalidInput(format!("invalid regex '{}': {}", pattern, e)))?;
                let found = match matcher.part.as_str() {
                    "header" => response.header_values().any(|value| re.is_match(value)),
                    "body" => re.is_match(&response.body),
                    other => return Err(unknown_part(other)),
                };
                results.push(found);
            }
            combine(&results, &matcher.condition)
        }
        "dsl" => {
            let context = DslContext::from_response(response);
            let results: Vec<bool> = matcher
                .dsl
                .iter()
                .map(|expression| match context.evaluate_expression(expression) {
                    Ok(value) => value.is_truthy(),
                    Err(e) => {
                        warn!("Error evaluating DSL expression '{}': {}", expression, e);
                        false
                    }
                })
                .collect();
            combine(&results, &matcher.condition)
        }
        other => Err(ScanError::InvalidInput(format!("unknown matcher type: {}", other))),
    }
}

fn unknown_part(part: &str) -> ScanError {
    ScanError::InvalidInput(format!("unknown response part: {}", part))
}
