use betascan::{
    catalog::{PortSelection, ServiceCatalog},
    cli::Cli,
    config::Config,
    display::DisplayManager,
    modules::{Dispatcher, ModuleOptions, ModuleRegistry},
    resolver::{self, EvaluationContext},
    scanner::{ScanOptions, Scanner},
    targets,
    template::RuleTemplate,
    template_engine::HttpIssuer,
    utils::progress::create_spinner,
    Result, ScanError,
};
use clap::{CommandFactory, Parser};
use env_logger::Env;
use log::{debug, info};
use std::collections::HashSet;
use std::process;
use std::sync::Arc;

const EXIT_FAILURE: i32 = 1;
const EXIT_FATAL_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level()))
        .format_timestamp_secs()
        .init();

    let display = DisplayManager::with_quiet(cli.quiet);

    let mut config = if let Some(config_path) = &cli.config {
        match Config::load_from_file(&config_path.to_string_lossy()) {
            Ok(config) => {
                info!("Loaded configuration from {}", config_path.display());
                config
            }
            Err(e) => {
                display.print_warning(&format!("Failed to load configuration: {}, using defaults", e));
                Config::default()
            }
        }
    } else {
        Config::default()
    };
    apply_overrides(&mut config, &cli);

    let registry = match user_rules(&config).and_then(|rules| build_registry(&config, rules)) {
        Ok(registry) => registry,
        Err(e) => {
            display.print_error(&e.to_string());
            process::exit(EXIT_FAILURE);
        }
    };

    if cli.list_modules {
        display.print_module_table(registry.modules());
        return;
    }

    if !cli.has_targets() {
        let _ = Cli::command().print_help();
        process::exit(EXIT_FAILURE);
    }

    if !cli.quiet {
        display.print_banner("BETASCAN - Port Scanner", Some(env!("CARGO_PKG_VERSION")));
    }

    match run(&cli, &config, &registry, &display).await {
        Ok(true) => {}
        Ok(false) => {
            display.print_error("Scanning interrupted by user. Exiting...");
            process::exit(EXIT_FAILURE);
        }
        Err(e) if e.is_fatal() => {
            display.print_error(&e.to_string());
            process::exit(EXIT_FATAL_CONFIG);
        }
        Err(e) => {
            display.print_error(&e.to_string());
            process::exit(EXIT_FAILURE);
        }
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(port) = &cli.port {
        config.scan.ports = port.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.scan.timeout = timeout;
    }
    if let Some(max_workers) = cli.max_workers {
        config.scan.max_workers = max_workers;
    }
    if let Some(host_workers) = cli.host_workers {
        config.scan.host_workers = host_workers;
    }
    if cli.banner {
        config.scan.banner = true;
    }
    if cli.no_limit_text {
        config.scan.limit_text = false;
    }
    if let Some(catalog) = &cli.catalog {
        config.paths.service_catalog = Some(catalog.clone());
    }
    if let Some(rules) = &cli.rules {
        config.paths.rules_dir = Some(rules.clone());
    }
    for (key, value) in &cli.options {
        config.modules.options.insert(key.clone(), value.clone());
    }
}

fn user_rules(config: &Config) -> Result<Vec<RuleTemplate>> {
    match &config.paths.rules_dir {
        Some(dir) => RuleTemplate::load_dir(dir),
        None => Ok(Vec::new()),
    }
}

fn build_registry(config: &Config, rules: Vec<RuleTemplate>) -> Result<ModuleRegistry> {
    let issuer = HttpIssuer::with_config(
        config.request_timeout(),
        config.http.max_redirects,
        config.http.verify_ssl,
        config.http.user_agent.clone(),
    )?;
    ModuleRegistry::builtin(Arc::new(issuer), config.request_timeout(), rules)
}

/// Every rule that will run must have its required options before any probe starts.
fn check_rule_options(registry: &ModuleRegistry, selected: &HashSet<String>, options: &ModuleOptions) -> Result<()> {
    let context = EvaluationContext::with_options(options);
    for rule in registry.rules_for(selected) {
        resolver::check_required(rule, &context)?;
    }
    Ok(())
}

fn catalog_from(config: &Config) -> Result<ServiceCatalog> {
    match &config.paths.service_catalog {
        Some(path) => ServiceCatalog::from_file(path),
        None => ServiceCatalog::builtin(),
    }
}

/// `Ok(false)` when the scan was cancelled.
async fn run(cli: &Cli, config: &Config, registry: &ModuleRegistry, display: &DisplayManager) -> Result<bool> {
    let options: ModuleOptions = config.modules.options.clone();
    let modules = registry.select(&cli.script, cli.all_scripts);
    let selected: HashSet<String> = modules.iter().map(|m| m.name().to_string()).collect();
    check_rule_options(registry, &selected, &options)?;
    debug!("Selected modules: {:?}", selected);

    let catalog = Arc::new(catalog_from(config)?);
    let ports = PortSelection::parse(&config.scan.ports)?.resolve(&catalog);
    if ports.is_empty() {
        return Err(ScanError::InvalidInput("no ports to scan".to_string()));
    }

    let mut inputs = cli.targets.clone();
    if let Some(list) = &cli.list {
        inputs.extend(targets::read_target_list(list)?);
    }

    let spinner = (!cli.quiet).then(|| create_spinner("Resolving targets"));
    let addresses = targets::resolve(&inputs).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    if addresses.is_empty() {
        return Err(ScanError::InvalidTarget("no valid targets".to_string()));
    }
    display.print_info(&format!(
        "Scanning {} host(s), {} port(s) each",
        addresses.len(),
        ports.len()
    ));

    let scan_options = ScanOptions {
        ports,
        timeout: config.connect_timeout(),
        max_workers: config.scan.max_workers,
        host_workers: config.scan.host_workers,
        banner: config.scan.banner,
        limit_text: config.scan.limit_text,
        show_progress: !cli.quiet,
    };
    let scanner = Scanner::new(scan_options, catalog, Dispatcher::new(modules, options));

    let cancel = scanner.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let summary = scanner
        .run(addresses, |tree| {
            display.print_host_tree(tree);
        })
        .await;

    display.print_scan_summary(&summary);
    Ok(!summary.cancelled)
}
