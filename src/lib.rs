//! Betascan - port scanner with rule-driven service fingerprinting
//!
//! Hosts are probed port by port; every open port is labeled from a
//! [`catalog::ServiceCatalog`] and handed to the detection modules whose
//! portrule covers those labels. Technology fingerprints are YAML rules run
//! by the [`template_engine::TemplateEngine`]: placeholders are resolved
//! once per invocation (see [`resolver`]), then matchers and extractors are
//! evaluated against a single response.
//!
//! # Warning
//! Only scan networks and systems you own or have explicit permission to test.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod display;
pub mod dsl;
pub mod error;
pub mod extractors;
pub mod matchers;
pub mod modules;
pub mod resolver;
pub mod scanner;
pub mod targets;
pub mod template;
pub mod template_engine;
pub mod utils;
pub mod xpath;

pub use error::{Result, ScanError};
