//! Service catalog: which well-known ports belong to which service label.

use crate::{Result, ScanError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const BUILTIN_CATALOG: &str = include_str!("../data/services.json");

/// Read-only label table shared by every probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: BTreeMap<String, Vec<u16>>,
}

impl ServiceCatalog {
    pub fn new(services: BTreeMap<String, Vec<u16>>) -> Self {
        Self { services }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let services: BTreeMap<String, Vec<u16>> = serde_json::from_str(content)?;
        Ok(Self { services })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScanError::InvalidInput(format!("cannot read service catalog {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Every service listing `port`, sorted by name.
    pub fn labels_for(&self, port: u16) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, ports)| ports.contains(&port))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Union of all catalog ports, ascending.
    pub fn all_ports(&self) -> Vec<u16> {
        self.services
            .values()
            .flatten()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// The `-p` argument: `ALL` or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelection {
    All,
    Explicit(Vec<u16>),
}

impl PortSelection {
    /// Parse `ALL`, or a comma list of ports and `a-b` ranges.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("all") {
            return Ok(PortSelection::All);
        }

        let mut ports = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some((start, end)) = part.split_once('-') {
                let start = parse_port(start)?;
                let end = parse_port(end)?;
                if start > end {
                    return Err(ScanError::InvalidInput(format!(
                        "Start port cannot be greater than end port: {}",
                        part
                    )));
                }
                ports.extend(start..=end);
            } else {
                ports.push(parse_port(part)?);
            }
        }

        if ports.is_empty() {
            return Err(ScanError::InvalidInput(format!("No ports in '{}'", spec)));
        }
        Ok(PortSelection::Explicit(ports))
    }

    /// Concrete ports to probe, sorted and deduplicated.
    pub fn resolve(&self, catalog: &ServiceCatalog) -> Vec<u16> {
        match self {
            PortSelection::All => catalog.all_ports(),
            PortSelection::Explicit(ports) => {
                let mut ports = ports.clone();
                ports.sort_unstable();
                ports.dedup();
                ports
            }
        }
    }
}

fn parse_port(text: &str) -> Result<u16> {
    match text.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ScanError::InvalidInput(format!("Invalid port: {}", text))),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_and_union() {
        let catalog = ServiceCatalog::from_json(r#"{"http":[80,443],"https":[443],"ssh":[22]}"#).unwrap();
        assert_eq!(catalog.labels_for(443), vec!["http".to_string(), "https".to_string()]);
        assert_eq!(catalog.labels_for(22), vec!["ssh".to_string()]);
        assert!(catalog.labels_for(8080).is_empty());
        assert_eq!(catalog.all_ports(), vec![22, 80, 443]);
    }

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = ServiceCatalog::builtin().unwrap();
        assert!(catalog.labels_for(443).contains(&"https".to_string()));
        assert_eq!(catalog.labels_for(8006), vec!["proxmox".to_string()]);
    }

    #[test]
    fn test_port_selection() {
        let catalog = ServiceCatalog::from_json(r#"{"ssh":[22],"http":[80]}"#).unwrap();
        assert_eq!(PortSelection::parse("ALL").unwrap().resolve(&catalog), vec![22, 80]);
        assert_eq!(
            PortSelection::parse("443, 80,8000-8002,80").unwrap().resolve(&catalog),
            vec![80, 443, 8000, 8001, 8002]
        );
        assert!(PortSelection::parse("0").is_err());
        assert!(PortSelection::parse("90-80").is_err());
        assert!(PortSelection::parse("http").is_err());
    }
}
