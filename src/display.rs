use crate::modules::DetectionModule;
use crate::scanner::{HostTree, ScanSummary};
use crate::utils::time::format_duration;
use colored::*;
use std::sync::Arc;

/// Console rendering for scan results and status messages
pub struct DisplayManager {
    use_colors: bool,
    quiet_mode: bool,
}

impl DisplayManager {
    pub fn new() -> Self {
        Self::with_quiet(false)
    }

    pub fn with_quiet(quiet: bool) -> Self {
        let use_colors = std::env::var("NO_COLOR").is_err()
            && std::env::var("TERM").map_or(true, |term| term != "dumb");

        Self {
            use_colors,
            quiet_mode: quiet,
        }
    }

    pub fn with_colors(mut self, use_colors: bool) -> Self {
        self.use_colors = use_colors;
        self
    }

    fn paint(&self, text: &str, style: fn(&str) -> ColoredString) -> String {
        if self.use_colors {
            style(text).to_string()
        } else {
            text.to_string()
        }
    }

    /// Render a host as a tree: open ports, then module output under each port.
    pub fn format_host_tree(&self, tree: &HostTree) -> String {
        let mut out = format!("Server on {}\n", self.paint(&tree.ip.to_string(), |s| s.green()));

        let port_count = tree.ports.len();
        for (i, node) in tree.open_ports().enumerate() {
            let last_port = i + 1 == port_count;
            let (branch, indent) = if last_port { ("└── ", "    ") } else { ("├── ", "│   ") };

            let mut line = format!(
                "Port Open {} [{}]",
                self.paint(&node.port.to_string(), |s| s.green().bold()),
                self.paint(&node.services.join(","), |s| s.blue())
            );
            if let Some(banner) = &node.banner {
                line.push(' ');
                line.push_str(banner);
            }
            push_block(&mut out, branch, indent, &line);

            let module_count = node.modules.len();
            for (j, report) in node.modules.iter().enumerate() {
                let last_module = j + 1 == module_count;
                let (branch, sub_indent) = if last_module { ("└── ", "    ") } else { ("├── ", "│   ") };
                push_block(
                    &mut out,
                    &format!("{}{}", indent, branch),
                    &format!("{}{}", indent, sub_indent),
                    &self.paint(&report.module, |s| s.white()),
                );

                let line_count = report.lines.len();
                for (k, text) in report.lines.iter().enumerate() {
                    let (leaf, leaf_indent) = if k + 1 == line_count { ("└── ", "    ") } else { ("├── ", "│   ") };
                    push_block(
                        &mut out,
                        &format!("{}{}{}", indent, sub_indent, leaf),
                        &format!("{}{}{}", indent, sub_indent, leaf_indent),
                        text,
                    );
                }
            }
        }

        out
    }

    pub fn print_host_tree(&self, tree: &HostTree) {
        println!("{}", self.format_host_tree(tree));
    }

    pub fn format_scan_summary(&self, summary: &ScanSummary) -> String {
        format!(
            "  {} Host Up      : {}\n  {} Host Close   : {}",
            self.paint("[UP]", |s| s.cyan()),
            summary.hosts_up,
            self.paint("[CL]", |s| s.red()),
            summary.hosts_closed
        )
    }

    pub fn print_scan_summary(&self, summary: &ScanSummary) {
        println!("{}", self.format_scan_summary(summary));
        if !self.quiet_mode {
            let detail = format!(
                "{} open port(s) on {}/{} host(s) in {}",
                summary.open_ports,
                summary.hosts_scanned,
                summary.total_hosts,
                format_duration(summary.elapsed)
            );
            println!("  {}", self.paint(&detail, |s| s.bright_black()));
        }
    }

    pub fn print_module_table(&self, modules: &[Arc<dyn DetectionModule>]) {
        let name_width = modules.iter().map(|m| m.name().len()).max().unwrap_or(4).max(4);
        let rule_width = modules
            .iter()
            .map(|m| m.portrule().join(",").len())
            .max()
            .unwrap_or(8)
            .max(8);

        println!(
            "  {:<nw$}  {:<rw$}  {}",
            self.paint("Name", |s| s.bright_white().bold()),
            self.paint("Portrule", |s| s.bright_white().bold()),
            self.paint("Description", |s| s.bright_white().bold()),
            nw = name_width,
            rw = rule_width
        );
        for module in modules {
            println!(
                "  {:<nw$}  {:<rw$}  {}",
                module.name(),
                module.portrule().join(","),
                module.description(),
                nw = name_width,
                rw = rule_width
            );
        }
    }

    pub fn print_banner(&self, title: &str, subtitle: Option<&str>) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!();
            println!("  {}", "┌─".bright_cyan().to_string() + &"─".repeat(title.len() + 2) + "─┐");
            println!("  {} {}   {}", "│".bright_cyan(), title.bright_white().bold(), "│".bright_cyan());
            if let Some(sub) = subtitle {
                println!(
                    "  {} {}   {}",
                    "│".bright_cyan(),
                    format!("{:^width$}", sub, width = title.len()).bright_black(),
                    "│".bright_cyan()
                );
            }
            println!("  {}", "└─".bright_cyan().to_string() + &"─".repeat(title.len() + 2) + "─┘");
            println!();
        } else {
            let border = "=".repeat(title.len() + 4);
            println!("\n{}", border);
            println!("  {}  ", title);
            if let Some(sub) = subtitle {
                println!("  {}  ", sub);
            }
            println!("{}\n", border);
        }
    }

    pub fn print_warning(&self, message: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", "!".bright_yellow().bold(), message.yellow());
        } else {
            println!("[!] {}", message);
        }
    }

    pub fn print_error(&self, message: &str) {
        if self.use_colors {
            eprintln!("  {} {}", "✗".bright_red().bold(), message.red().bold());
        } else {
            eprintln!("[✗] {}", message);
        }
    }

    pub fn print_info(&self, message: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", "i".bright_blue().bold(), message.blue());
        } else {
            println!("[i] {}", message);
        }
    }
}

impl Default for DisplayManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Append `text` under `branch`; continuation lines of a multi-line text use `indent`.
fn push_block(out: &mut String, branch: &str, indent: &str, text: &str) {
    for (i, line) in text.lines().enumerate() {
        out.push_str(if i == 0 { branch } else { indent });
        out.push_str(line);
        out.push('\n');
    }
    if text.is_empty() {
        out.push_str(branch);
        out.push('\n');
    }
}
