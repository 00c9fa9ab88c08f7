//! Turning command line target specs into addresses.

use crate::{Result, ScanError};
use log::{debug, warn};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tokio::net::lookup_host;

/// Largest block, in addresses, that is expanded host by host.
pub const MAX_CIDR_HOSTS: u128 = 65_536;

/// Expand target specs into address literals and hostnames.
///
/// Accepts file paths (one spec per line), URLs, CIDR blocks, IPv4 ranges
/// and comma separated lists. Invalid specs are reported and skipped.
pub fn expand(inputs: &[String]) -> Vec<String> {
    let mut expanded = Vec::new();
    for input in inputs {
        expand_into(input.trim(), &mut expanded, 0);
    }
    expanded
}

fn expand_into(target: &str, out: &mut Vec<String>, depth: usize) {
    if target.is_empty() {
        return;
    }

    let path = Path::new(target);
    if depth == 0 && path.is_file() {
        match read_target_list(path) {
            Ok(lines) => lines.iter().for_each(|line| expand_into(line, out, depth + 1)),
            Err(e) => warn!("{}", e),
        }
    } else if target.contains("://") {
        match host_of_url(target) {
            Ok(host) => out.push(host),
            Err(e) => warn!("{}", e),
        }
    } else if target.contains(',') {
        target
            .split(',')
            .for_each(|part| expand_into(part.trim(), out, depth + 1));
    } else if target.contains('/') {
        match parse_cidr(target) {
            Ok(ips) => out.extend(ips.iter().map(IpAddr::to_string)),
            Err(e) => warn!("{}", e),
        }
    } else if target.contains('-') && target.split('-').next().map_or(false, |s| s.parse::<Ipv4Addr>().is_ok()) {
        match parse_range(target) {
            Ok(ips) => out.extend(ips.iter().map(IpAddr::to_string)),
            Err(e) => warn!("{}", e),
        }
    } else {
        out.push(target.to_string());
    }
}

/// Non-empty, non-comment lines of a target list file.
pub fn read_target_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ScanError::InvalidInput(format!("cannot read target list {}: {}", path.display(), e))
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn host_of_url(target: &str) -> Result<String> {
    let url = url::Url::parse(target)
        .map_err(|e| ScanError::InvalidTarget(format!("Invalid URL {}: {}", target, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| ScanError::InvalidTarget(format!("URL without host: {}", target)))?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

/// Host addresses of a CIDR block.
///
/// IPv4 skips the network and broadcast addresses unless the prefix is /31
/// or /32. IPv6 skips the subnet-router address. Blocks larger than
/// [`MAX_CIDR_HOSTS`] (wider than /16 or /112) are rejected.
pub fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    let (address, prefix) = cidr
        .trim()
        .split_once('/')
        .ok_or_else(|| ScanError::InvalidTarget(format!("Invalid CIDR format: {}", cidr)))?;

    let prefix_len: u8 = prefix
        .parse()
        .map_err(|_| ScanError::InvalidTarget(format!("Invalid prefix length: {}", prefix)))?;

    let address: IpAddr = address
        .parse()
        .map_err(|_| ScanError::InvalidTarget(format!("Invalid IP in CIDR: {}", address)))?;

    match address {
        IpAddr::V4(base) => {
            if prefix_len > 32 {
                return Err(ScanError::InvalidTarget("Prefix length cannot exceed 32".to_string()));
            }
            let host_bits = 32 - u32::from(prefix_len);
            let size: u64 = 1u64 << host_bits;
            check_block_size(cidr, u128::from(size))?;
            let network = u64::from(u32::from(base)) & !(size - 1);
            let last = network + size - 1;

            let (first, last) = if prefix_len >= 31 { (network, last) } else { (network + 1, last - 1) };
            Ok((first..=last)
                .map(|ip| IpAddr::V4(Ipv4Addr::from(ip as u32)))
                .collect())
        }
        IpAddr::V6(base) => {
            if prefix_len > 128 {
                return Err(ScanError::InvalidTarget("Prefix length cannot exceed 128".to_string()));
            }
            let host_bits = 128 - u32::from(prefix_len);
            if host_bits >= 64 {
                return Err(too_large(cidr));
            }
            let size: u128 = 1u128 << host_bits;
            check_block_size(cidr, size)?;
            let network = u128::from(base) & !(size - 1);
            let last = network + size - 1;

            let first = if prefix_len == 128 { network } else { network + 1 };
            Ok((first..=last)
                .map(|ip| IpAddr::V6(Ipv6Addr::from(ip)))
                .collect())
        }
    }
}

fn too_large(cidr: &str) -> ScanError {
    ScanError::InvalidTarget(format!(
        "CIDR block {} is too large to enumerate (limit {} addresses)",
        cidr, MAX_CIDR_HOSTS
    ))
}

fn check_block_size(cidr: &str, size: u128) -> Result<()> {
    if size > MAX_CIDR_HOSTS {
        return Err(too_large(cidr));
    }
    Ok(())
}

/// `a.b.c.d-e.f.g.h`, or the short form `a.b.c.d-N` that replaces the last octet.
pub fn parse_range(range: &str) -> Result<Vec<IpAddr>> {
    let (start, end) = range
        .trim()
        .split_once('-')
        .ok_or_else(|| ScanError::InvalidTarget(format!("Invalid range format: {}", range)))?;

    let start_ip: Ipv4Addr = start
        .trim()
        .parse()
        .map_err(|_| ScanError::InvalidTarget(format!("Invalid start IP: {}", start)))?;

    let end = end.trim();
    let end_ip: Ipv4Addr = match end.parse::<u8>() {
        Ok(last_octet) => {
            let [a, b, c, _] = start_ip.octets();
            Ipv4Addr::new(a, b, c, last_octet)
        }
        Err(_) => end
            .parse()
            .map_err(|_| ScanError::InvalidTarget(format!("Invalid end IP: {}", end)))?,
    };

    let start = u32::from(start_ip);
    let end = u32::from(end_ip);
    if start > end {
        return Err(ScanError::InvalidTarget("Start IP cannot be greater than end IP".to_string()));
    }
    if u128::from(end - start) >= MAX_CIDR_HOSTS {
        return Err(ScanError::InvalidTarget(format!(
            "Range {} is too large to enumerate (limit {} addresses)",
            range, MAX_CIDR_HOSTS
        )));
    }

    Ok((start..=end).map(|ip| IpAddr::V4(Ipv4Addr::from(ip))).collect())
}

/// Resolve a hostname, preferring the first IPv4 answer.
pub async fn resolve_hostname(hostname: &str) -> Result<IpAddr> {
    let addrs: Vec<IpAddr> = lookup_host(format!("{}:80", hostname))
        .await
        .map_err(|e| ScanError::InvalidTarget(format!("Failed to resolve {}: {}", hostname, e)))?
        .map(|addr| addr.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ScanError::InvalidTarget(format!("No addresses for {}", hostname)))
}

/// Expand and resolve `inputs` into unique addresses, in first-seen order.
pub async fn resolve(inputs: &[String]) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();

    for target in expand(inputs) {
        let ip = match target.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => match resolve_hostname(&target).await {
                Ok(ip) => {
                    debug!("Resolved {} to {}", target, ip);
                    ip
                }
                Err(e) => {
                    warn!("Skipping target: {}", e);
                    continue;
                }
            },
        };
        if seen.insert(ip) {
            addresses.push(ip);
        }
    }

    addresses
}
