//! Detection modules and the dispatcher that runs them on open ports.

mod http;
mod ssl_cert;
mod technologies;

pub use http::{HttpHeaders, HttpTitle};
pub use ssl_cert::{CertificateSummary, SslCert};
pub use technologies::{RuleModule, Technologies};

use crate::template::RuleTemplate;
use crate::template_engine::{RequestIssuer, TemplateEngine};
use crate::Result;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub type ModuleOptions = HashMap<String, String>;

/// What a module produced for one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOutput {
    None,
    Line(String),
    Lines(Vec<String>),
}

impl ModuleOutput {
    pub fn into_lines(self) -> Vec<String> {
        match self {
            ModuleOutput::None => Vec::new(),
            ModuleOutput::Line(line) if line.is_empty() => Vec::new(),
            ModuleOutput::Line(line) => vec![line],
            ModuleOutput::Lines(lines) => lines,
        }
    }
}

#[async_trait]
pub trait DetectionModule: Send + Sync {
    fn name(&self) -> &str;

    /// Service labels this module knows how to handle.
    fn portrule(&self) -> &[&str];

    fn description(&self) -> &str;

    async fn run(&self, ip: IpAddr, port: u16, options: &ModuleOptions) -> Result<ModuleOutput>;
}

/// A module applies when every discovered label is in its portrule.
pub fn is_eligible(module: &dyn DetectionModule, labels: &[String]) -> bool {
    let portrule = module.portrule();
    labels.iter().all(|label| portrule.contains(&label.as_str()))
}

/// `1`, `true`, `yes` and `on` (any case) enable a flag option.
pub fn option_enabled(options: &ModuleOptions, name: &str) -> bool {
    options
        .get(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Output lines of one module under a port node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReport {
    pub module: String,
    pub lines: Vec<String>,
}

/// Runs the selected modules against an open port.
#[derive(Clone)]
pub struct Dispatcher {
    modules: Vec<Arc<dyn DetectionModule>>,
    options: Arc<ModuleOptions>,
}

impl Dispatcher {
    pub fn new(modules: Vec<Arc<dyn DetectionModule>>, options: ModuleOptions) -> Self {
        Self {
            modules,
            options: Arc::new(options),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Module failures are reported inline; they never abort sibling modules.
    pub async fn dispatch(&self, ip: IpAddr, port: u16, labels: &[String]) -> Vec<ModuleReport> {
        let mut reports = Vec::new();

        for module in &self.modules {
            if !is_eligible(module.as_ref(), labels) {
                continue;
            }

            debug!("Running module {} on {}:{}", module.name(), ip, port);
            let lines = match module.run(ip, port, &self.options).await {
                Ok(output) => output.into_lines(),
                Err(e) => {
                    warn!("Module {} failed on {}:{}: {}", module.name(), ip, port, e);
                    vec![format!("Error: {}", e)]
                }
            };

            if !lines.is_empty() {
                reports.push(ModuleReport {
                    module: module.name().to_string(),
                    lines,
                });
            }
        }

        reports
    }
}

/// Every module known to this build.
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn DetectionModule>>,
    fingerprints: Vec<RuleTemplate>,
    rules: Vec<RuleTemplate>,
}

impl ModuleRegistry {
    /// Built-in modules, plus one module per user rule in `rules`.
    /// The technology fingerprints combine the embedded set with `rules`.
    pub fn builtin(
        issuer: Arc<dyn RequestIssuer>,
        tls_timeout: Duration,
        rules: Vec<RuleTemplate>,
    ) -> Result<Self> {
        let engine = TemplateEngine::new(Arc::clone(&issuer));

        let mut fingerprints = RuleTemplate::builtin_technologies()?;
        fingerprints.extend(rules.iter().cloned());

        let mut modules: Vec<Arc<dyn DetectionModule>> = vec![
            Arc::new(HttpTitle::new(Arc::clone(&issuer))),
            Arc::new(HttpHeaders::new(Arc::clone(&issuer))),
            Arc::new(SslCert::new(tls_timeout)),
            Arc::new(Technologies::new(engine.clone(), fingerprints.clone())),
        ];
        for rule in &rules {
            modules.push(Arc::new(RuleModule::new(engine.clone(), rule.clone())));
        }

        Ok(Self {
            modules,
            fingerprints,
            rules,
        })
    }

    /// Rule templates that the modules named in `selected` will execute.
    pub fn rules_for<'a>(&'a self, selected: &'a HashSet<String>) -> impl Iterator<Item = &'a RuleTemplate> + 'a {
        let standalone = self.rules.iter().filter(move |rule| selected.contains(&rule.id));
        let technologies = self
            .fingerprints
            .iter()
            .filter(move |_| selected.contains("technologies"));
        standalone.chain(technologies)
    }

    pub fn modules(&self) -> &[Arc<dyn DetectionModule>] {
        &self.modules
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DetectionModule>> {
        self.modules.iter().find(|m| m.name() == name).cloned()
    }

    /// Modules named in `names`, or every module when `all` is set.
    /// Unknown names are reported and ignored.
    pub fn select(&self, names: &[String], all: bool) -> Vec<Arc<dyn DetectionModule>> {
        if all {
            return self.modules.clone();
        }

        let mut selected = Vec::new();
        for name in names {
            match self.get(name) {
                Some(module) => selected.push(module),
                None => warn!("Unknown module: {}", name),
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScanError;

    struct Fixed {
        name: &'static str,
        portrule: Vec<&'static str>,
        output: std::result::Result<ModuleOutput, String>,
    }

    #[async_trait]
    impl DetectionModule for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn portrule(&self) -> &[&str] {
            &self.portrule
        }

        fn description(&self) -> &str {
            "fixed output"
        }

        async fn run(&self, _ip: IpAddr, _port: u16, _options: &ModuleOptions) -> Result<ModuleOutput> {
            self.output.clone().map_err(ScanError::Module)
        }
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_eligibility_is_subset() {
        let module = Fixed {
            name: "web",
            portrule: vec!["http", "https"],
            output: Ok(ModuleOutput::None),
        };
        assert!(is_eligible(&module, &labels(&["http"])));
        assert!(is_eligible(&module, &labels(&["http", "https"])));
        assert!(!is_eligible(&module, &labels(&["http", "ssh"])));
        assert!(is_eligible(&module, &[]));
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failures() {
        let dispatcher = Dispatcher::new(
            vec![
                Arc::new(Fixed {
                    name: "broken",
                    portrule: vec!["http"],
                    output: Err("boom".to_string()),
                }),
                Arc::new(Fixed {
                    name: "list",
                    portrule: vec!["http"],
                    output: Ok(ModuleOutput::Lines(vec!["a".to_string(), "b".to_string()])),
                }),
                Arc::new(Fixed {
                    name: "silent",
                    portrule: vec!["http"],
                    output: Ok(ModuleOutput::None),
                }),
                Arc::new(Fixed {
                    name: "ssh-only",
                    portrule: vec!["ssh"],
                    output: Ok(ModuleOutput::Line("never".to_string())),
                }),
            ],
            ModuleOptions::new(),
        );

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let reports = dispatcher.dispatch(ip, 80, &labels(&["http"])).await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].module, "broken");
        assert_eq!(reports[0].lines, vec!["Error: Module error: boom".to_string()]);
        assert_eq!(reports[1].lines, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_option_enabled() {
        let mut options = ModuleOptions::new();
        options.insert("useget".to_string(), "True".to_string());
        options.insert("off".to_string(), "0".to_string());
        assert!(option_enabled(&options, "useget"));
        assert!(!option_enabled(&options, "off"));
        assert!(!option_enabled(&options, "missing"));
    }
}
