use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "betascan")]
#[command(about = "Port scanner with service fingerprinting driven by YAML detection rules")]
#[command(long_about = r#"
Betascan probes TCP ports, labels open ports from a service catalog and runs
detection modules (HTTP title, headers, TLS certificate, technology
fingerprints) against the services it finds.

Only scan networks and systems you own or have explicit permission to test.

Usage Examples:
  betascan 192.168.1.10                        # All catalog ports
  betascan 192.168.1.0/24 -p 22,80,443 -b      # Selected ports with banners
  betascan 10.0.0.1-20 --script http-title     # Run one module
  betascan example.com -A -o path=/login       # All modules with an option
  betascan --list targets.txt --rules ./rules  # Extra technology rules
"#)]
#[command(version)]
pub struct Cli {
    /// IP addresses, hostnames, CIDR blocks, ranges (a-b), URLs or files of targets
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Ports to scan: ALL, or a list such as 22,80,8000-8100
    #[arg(short = 'p', long = "port", value_name = "PORTS")]
    pub port: Option<String>,

    /// File with one target or CIDR block per line
    #[arg(long, value_name = "FILE")]
    pub list: Option<PathBuf>,

    /// Connect timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Concurrent port probes per host
    #[arg(long = "max_workers", visible_alias = "max-workers", value_name = "N")]
    pub max_workers: Option<usize>,

    /// Hosts scanned at once
    #[arg(long = "host-workers", value_name = "N")]
    pub host_workers: Option<usize>,

    /// Detection modules to run, comma separated
    #[arg(long, value_name = "MODULES", value_delimiter = ',')]
    pub script: Vec<String>,

    /// Run every detection module
    #[arg(short = 'A')]
    pub all_scripts: bool,

    /// Show raw banners in full instead of truncating them
    #[arg(short = 'l', long = "limit-text")]
    pub no_limit_text: bool,

    /// Grab a banner from every open port
    #[arg(short = 'b', long)]
    pub banner: bool,

    /// Module and rule option as key=value (repeatable)
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub options: Vec<(String, String)>,

    /// Service catalog JSON (service name to port list)
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Directory of additional YAML detection rules
    #[arg(long, value_name = "DIR")]
    pub rules: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (only results)
    #[arg(short, long)]
    pub quiet: bool,

    /// List available detection modules and exit
    #[arg(long)]
    pub list_modules: bool,
}

impl Cli {
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty() || self.list.is_some()
    }
}

pub fn parse_key_value(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", input))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option name in '{}'", input));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::try_parse_from([
            "betascan",
            "10.0.0.1",
            "10.0.0.0/30",
            "-p",
            "80,443",
            "--max_workers",
            "20",
            "--script",
            "http-title,ssl-cert",
            "-o",
            "path=/admin",
            "-o",
            "useget=true",
            "-l",
            "-b",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.targets, vec!["10.0.0.1", "10.0.0.0/30"]);
        assert_eq!(cli.port.as_deref(), Some("80,443"));
        assert_eq!(cli.max_workers, Some(20));
        assert_eq!(cli.script, vec!["http-title", "ssl-cert"]);
        assert_eq!(
            cli.options,
            vec![
                ("path".to_string(), "/admin".to_string()),
                ("useget".to_string(), "true".to_string())
            ]
        );
        assert!(cli.no_limit_text);
        assert!(cli.banner);
        assert_eq!(cli.log_level(), "debug");
    }

    #[test]
    fn test_max_workers_alias_and_bad_option() {
        let cli = Cli::try_parse_from(["betascan", "h", "--max-workers", "5", "-A"]).unwrap();
        assert_eq!(cli.max_workers, Some(5));
        assert!(cli.all_scripts);

        assert!(Cli::try_parse_from(["betascan", "h", "-o", "novalue"]).is_err());
    }
}
