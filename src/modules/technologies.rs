use super::{DetectionModule, ModuleOptions, ModuleOutput};
use crate::template::{RequestSpec, RuleInfo, RuleTemplate};
use crate::template_engine::{MatchOutcome, TemplateEngine};
use crate::Result;
use async_trait::async_trait;
use log::warn;
use std::net::IpAddr;

/// `Name [extracted] (type)` for every matched block.
fn describe_matches(info: &RuleInfo, outcomes: &[MatchOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|outcome| outcome.matched)
        .map(|outcome| match &outcome.extracted {
            Some(extracted) => format!("{} [{}] ({})", info.name, extracted, info.kind),
            None => format!("{} ({})", info.name, info.kind),
        })
        .collect()
}

/// Fingerprints a web service with every technology rule, sharing one response.
pub struct Technologies {
    engine: TemplateEngine,
    rules: Vec<RuleTemplate>,
}

impl Technologies {
    pub fn new(engine: TemplateEngine, rules: Vec<RuleTemplate>) -> Self {
        Self { engine, rules }
    }
}

#[async_trait]
impl DetectionModule for Technologies {
    fn name(&self) -> &str {
        "technologies"
    }

    fn portrule(&self) -> &[&str] {
        &["http", "https"]
    }

    fn description(&self) -> &str {
        "Get technologies"
    }

    async fn run(&self, ip: IpAddr, port: u16, options: &ModuleOptions) -> Result<ModuleOutput> {
        let path = options.get("path").map(String::as_str).unwrap_or("/");
        let response = self.engine.issuer().issue(ip, port, &RequestSpec::get(path)).await?;

        let mut found = Vec::new();
        for rule in &self.rules {
            match TemplateEngine::run_on_response(rule, &response, options) {
                Ok(outcomes) => found.extend(describe_matches(&rule.info, &outcomes)),
                Err(e) => {
                    warn!("Technology rule {} failed on {}:{}: {}", rule.id, ip, port, e);
                    let name = if rule.info.name.is_empty() { &rule.id } else { &rule.info.name };
                    found.push(format!("{}: Error: {}", name, e));
                }
            }
        }

        Ok(if found.is_empty() {
            ModuleOutput::None
        } else {
            ModuleOutput::Lines(found)
        })
    }
}

/// A user rule exposed as a module under its own id. It sends the rule's
/// own request.
pub struct RuleModule {
    engine: TemplateEngine,
    template: RuleTemplate,
    description: String,
}

impl RuleModule {
    pub fn new(engine: TemplateEngine, template: RuleTemplate) -> Self {
        let description = template
            .info
            .description
            .clone()
            .unwrap_or_else(|| template.info.name.clone());
        Self {
            engine,
            template,
            description,
        }
    }
}

#[async_trait]
impl DetectionModule for RuleModule {
    fn name(&self) -> &str {
        &self.template.id
    }

    fn portrule(&self) -> &[&str] {
        &["http", "https"]
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ip: IpAddr, port: u16, options: &ModuleOptions) -> Result<ModuleOutput> {
        let outcomes = self.engine.run(&self.template, ip, port, options).await?;
        let lines = describe_matches(&self.template.info, &outcomes);
        Ok(if lines.is_empty() {
            ModuleOutput::None
        } else {
            ModuleOutput::Lines(lines)
        })
    }
}
