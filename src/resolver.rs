//! `{{token}}` substitution over rule documents.

use crate::dsl;
use crate::template::{Rule, RuleOption, RuleTemplate};
use crate::{Result, ScanError};
use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern"));

/// Variables visible while resolving one rule invocation.
///
/// Seeded from module options and grown with every DSL result, so a
/// `{{rand_base(8)}}` referenced twice yields the same string. A context
/// belongs to a single invocation and is dropped with it.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    variables: HashMap<String, String>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: &HashMap<String, String>) -> Self {
        Self {
            variables: options.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

fn looks_like_call(token: &str) -> bool {
    token.contains('(') && token.contains(')')
}

/// Resolve every placeholder in one string.
pub fn resolve_str(
    text: &str,
    options: &BTreeMap<String, RuleOption>,
    context: &mut EvaluationContext,
) -> Result<String> {
    let mut resolved = String::with_capacity(text.len());
    let mut last = 0;

    for captures in PLACEHOLDER.captures_iter(text) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        resolved.push_str(&text[last..whole.start()]);
        last = whole.end();

        let token = inner.as_str().trim();
        if let Some(value) = context.get(token) {
            resolved.push_str(value);
        } else if looks_like_call(token) {
            let value = dsl::evaluate(token)?.to_string();
            trace!("Evaluated {{{{{}}}}} -> {}", token, value);
            context.insert(token, value.clone());
            resolved.push_str(&value);
        } else if let Some(default) = options.get(token).and_then(RuleOption::default_text) {
            resolved.push_str(&default);
        } else {
            resolved.push_str(whole.as_str());
        }
    }

    resolved.push_str(&text[last..]);
    Ok(resolved)
}

/// Resolve placeholders recursively through strings, sequences and mappings.
/// Mapping keys and non-string scalars are left untouched.
pub fn resolve(
    document: &Value,
    options: &BTreeMap<String, RuleOption>,
    context: &mut EvaluationContext,
) -> Result<Value> {
    match document {
        Value::String(s) => Ok(Value::String(resolve_str(s, options, context)?)),
        Value::Sequence(items) => items
            .iter()
            .map(|item| resolve(item, options, context))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut resolved = serde_yaml::Mapping::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve(value, options, context)?);
            }
            Ok(Value::Mapping(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Fail with every required option of `template` that `context` does not supply.
pub fn check_required(template: &RuleTemplate, context: &EvaluationContext) -> Result<()> {
    let missing: Vec<String> = template
        .required_options()
        .filter(|name| !context.contains(name))
        .map(str::to_string)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ScanError::MissingRequiredOption {
            rule_id: template.id.clone(),
            options: missing,
        })
    }
}

/// Resolve a template into a typed [`Rule`] for one invocation.
pub fn resolve_rule(template: &RuleTemplate, context: &mut EvaluationContext) -> Result<Rule> {
    let document = resolve(template.document(), &template.options, context)?;
    check_required(template, context)?;
    Ok(serde_yaml::from_value(document)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_default(name: &str, default: &str) -> BTreeMap<String, RuleOption> {
        let mut options = BTreeMap::new();
        options.insert(
            name.to_string(),
            RuleOption {
                default: Some(Value::String(default.to_string())),
                required: false,
            },
        );
        options
    }

    #[test]
    fn test_option_default_and_override() {
        let options = options_with_default("path", "/admin");

        let mut context = EvaluationContext::new();
        assert_eq!(resolve_str("{{path}}/login", &options, &mut context).unwrap(), "/admin/login");

        let mut supplied = HashMap::new();
        supplied.insert("path".to_string(), "/portal".to_string());
        let mut context = EvaluationContext::with_options(&supplied);
        assert_eq!(resolve_str("{{ path }}/login", &options, &mut context).unwrap(), "/portal/login");
    }

    #[test]
    fn test_unknown_token_is_left_verbatim() {
        let mut context = EvaluationContext::new();
        let resolved = resolve_str("x={{nothing}} y={{}}", &BTreeMap::new(), &mut context).unwrap();
        assert_eq!(resolved, "x={{nothing}} y={{}}");
        assert!(context.is_empty());
    }

    #[test]
    fn test_calls_are_memoized_per_context() {
        let mut context = EvaluationContext::new();
        let resolved = resolve_str("{{rand_base(6)}}-{{ rand_base(6) }}", &BTreeMap::new(), &mut context).unwrap();
        let (left, right) = resolved.split_once('-').unwrap();
        assert_eq!(left, right);
        assert_eq!(context.get("rand_base(6)"), Some(left));

        let flag = resolve_str("{{contains('abc', 'b')}}", &BTreeMap::new(), &mut context).unwrap();
        assert_eq!(flag, "true");
    }

    #[test]
    fn test_rejected_call_is_an_evaluation_error() {
        let mut context = EvaluationContext::new();
        let result = resolve_str("{{system('id')}}", &BTreeMap::new(), &mut context);
        assert!(matches!(result, Err(ScanError::Evaluation(_))));
        assert!(context.is_empty());
    }

    #[test]
    fn test_resolve_walks_nested_documents() {
        let document: Value = serde_yaml::from_str("a: ['{{name}}', 3, {b: '{{name}}!'}]").unwrap();
        let mut context = EvaluationContext::new();
        context.insert("name", "pve");

        let resolved = resolve(&document, &BTreeMap::new(), &mut context).unwrap();
        let expected: Value = serde_yaml::from_str("a: ['pve', 3, {b: 'pve!'}]").unwrap();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_check_required_names_every_missing_option() {
        let template = RuleTemplate::from_yaml(
            "id: creds\noptions:\n  user: {required: true}\n  pass: {required: true}\n  port: {default: 8006}\n",
        )
        .unwrap();

        match check_required(&template, &EvaluationContext::new()) {
            Err(ScanError::MissingRequiredOption { rule_id, options }) => {
                assert_eq!(rule_id, "creds");
                assert_eq!(options, vec!["pass".to_string(), "user".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let mut context = EvaluationContext::new();
        context.insert("user", "root");
        context.insert("pass", "x");
        assert!(check_required(&template, &context).is_ok());
    }
}
