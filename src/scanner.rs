//! Scan orchestration: hosts fan out to ports, ports fan in to one tree per host.

use crate::catalog::ServiceCatalog;
use crate::discovery::PortProber;
use crate::modules::{Dispatcher, ModuleReport};
use crate::utils::progress::create_progress_bar;
use crate::{Result, ScanError};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub ports: Vec<u16>,
    pub timeout: Duration,
    /// Concurrent probes per host.
    pub max_workers: usize,
    /// Hosts scanned at once.
    pub host_workers: usize,
    pub banner: bool,
    pub limit_text: bool,
    pub show_progress: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            timeout: Duration::from_secs(2),
            max_workers: 10,
            host_workers: 100,
            banner: false,
            limit_text: true,
            show_progress: false,
        }
    }
}

/// One open port with everything learned about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortNode {
    pub port: u16,
    pub services: Vec<String>,
    pub banner: Option<String>,
    pub modules: Vec<ModuleReport>,
}

/// Result tree of one host. Ports are kept in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTree {
    pub ip: IpAddr,
    pub ports: BTreeMap<u16, PortNode>,
}

impl HostTree {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            ports: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, node: PortNode) {
        self.ports.insert(node.port, node);
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &PortNode> {
        self.ports.values()
    }
}

/// Process-wide stop request. Polled before new work starts and before a
/// result is reported; running socket operations finish on their own.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct ScanProgress {
    pub hosts_scanned: AtomicUsize,
    pub hosts_up: AtomicUsize,
    pub hosts_closed: AtomicUsize,
    pub open_ports: AtomicUsize,
}

impl ScanProgress {
    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.hosts_scanned.load(Ordering::Relaxed),
            self.hosts_up.load(Ordering::Relaxed),
            self.hosts_closed.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub total_hosts: usize,
    pub hosts_scanned: usize,
    pub hosts_up: usize,
    pub hosts_closed: usize,
    pub open_ports: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

pub struct Scanner {
    options: ScanOptions,
    prober: PortProber,
    catalog: Arc<ServiceCatalog>,
    dispatcher: Dispatcher,
    cancel: CancellationFlag,
    progress: Arc<ScanProgress>,
}

impl Scanner {
    pub fn new(options: ScanOptions, catalog: Arc<ServiceCatalog>, dispatcher: Dispatcher) -> Self {
        let prober = PortProber::new(options.timeout, options.banner, options.limit_text);
        Self {
            options,
            prober,
            catalog,
            dispatcher,
            cancel: CancellationFlag::new(),
            progress: Arc::new(ScanProgress::default()),
        }
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn progress(&self) -> Arc<ScanProgress> {
        Arc::clone(&self.progress)
    }

    /// Probe every configured port of `ip`.
    ///
    /// Probes report through a channel to a single aggregating task, which
    /// owns the tree. Returns `None` when no port is open or the scan was cancelled.
    pub async fn scan_host(&self, ip: IpAddr) -> Result<Option<HostTree>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PortNode>();

        let aggregator = tokio::spawn(async move {
            let mut tree = HostTree::new(ip);
            while let Some(node) = rx.recv().await {
                tree.insert(node);
            }
            tree
        });

        stream::iter(self.options.ports.iter().copied())
            .for_each_concurrent(self.options.max_workers.max(1), |port| {
                let tx = tx.clone();
                async move {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    let Some(open) = self.prober.probe(ip, port).await else {
                        return;
                    };

                    let services = self.catalog.labels_for(port);
                    let modules = if self.dispatcher.is_empty() {
                        Vec::new()
                    } else {
                        self.dispatcher.dispatch(ip, port, &services).await
                    };

                    if self.cancel.is_cancelled() {
                        return;
                    }
                    self.progress.open_ports.fetch_add(1, Ordering::Relaxed);
                    let node = PortNode {
                        port: open.port,
                        services,
                        banner: open.banner,
                        modules,
                    };
                    if tx.send(node).is_err() {
                        warn!("Result collector for {} is gone, dropping port {}", ip, port);
                    }
                }
            })
            .await;

        drop(tx);
        let tree = aggregator
            .await
            .map_err(|e| ScanError::Unknown(format!("result collector for {} failed: {}", ip, e)))?;

        // A host interrupted mid-scan holds a partial tree.
        if self.cancel.is_cancelled() || tree.is_empty() {
            return Ok(None);
        }
        Ok(Some(tree))
    }

    /// Scan every target, `host_workers` at a time, handing each finished
    /// host with open ports to `on_host` as it completes.
    pub async fn run<F>(&self, targets: Vec<IpAddr>, mut on_host: F) -> ScanSummary
    where
        F: FnMut(&HostTree),
    {
        let start = Instant::now();
        let total = targets.len();
        info!(
            "Scanning {} host(s), {} port(s) each",
            total,
            self.options.ports.len()
        );

        let bar = self.options.show_progress.then(|| create_progress_bar(total as u64, "Scanning Start"));

        let mut results = stream::iter(targets)
            .map(|ip| async move {
                if self.cancel.is_cancelled() {
                    return None;
                }
                let outcome = self.scan_host(ip).await;
                if self.cancel.is_cancelled() {
                    return None;
                }
                self.progress.hosts_scanned.fetch_add(1, Ordering::Relaxed);
                match &outcome {
                    Ok(Some(_)) => self.progress.hosts_up.fetch_add(1, Ordering::Relaxed),
                    _ => self.progress.hosts_closed.fetch_add(1, Ordering::Relaxed),
                };
                Some((ip, outcome))
            })
            .buffer_unordered(self.options.host_workers.max(1));

        while let Some(finished) = results.next().await {
            let Some((ip, outcome)) = finished else {
                continue;
            };

            if let Some(bar) = &bar {
                let (scanned, _, _) = self.progress.snapshot();
                bar.set_message(format!("Scanning {}/{}", scanned, total));
                bar.inc(1);
            }

            match outcome {
                Ok(Some(_)) if self.cancel.is_cancelled() => debug!("Dropping result for {} after cancellation", ip),
                Ok(Some(tree)) => match &bar {
                    Some(bar) => bar.suspend(|| on_host(&tree)),
                    None => on_host(&tree),
                },
                Ok(None) => debug!("No open ports on {}", ip),
                Err(e) => warn!("Scan of {} failed: {}", ip, e),
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        let (hosts_scanned, hosts_up, hosts_closed) = self.progress.snapshot();
        ScanSummary {
            total_hosts: total,
            hosts_scanned,
            hosts_up,
            hosts_closed,
            open_ports: self.progress.open_ports.load(Ordering::Relaxed),
            cancelled: self.cancel.is_cancelled(),
            elapsed: start.elapsed(),
        }
    }
}
