use async_trait::async_trait;
use betascan::{
    catalog::{PortSelection, ServiceCatalog},
    config::Config,
    matchers,
    modules::{DetectionModule, Dispatcher, HttpHeaders, HttpTitle, ModuleOptions, ModuleOutput, ModuleRegistry},
    scanner::{CancellationFlag, ScanOptions, Scanner},
    template::{Matcher, RequestSpec, ResponseInfo, RuleTemplate},
    template_engine::{HttpIssuer, RequestIssuer, TemplateEngine},
    Result, ScanError,
};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Answers every request with its own path as the body.
#[derive(Default)]
struct EchoIssuer {
    calls: AtomicUsize,
    paths: Mutex<Vec<String>>,
}

#[async_trait]
impl RequestIssuer for EchoIssuer {
    async fn issue(&self, _ip: IpAddr, _port: u16, request: &RequestSpec) -> Result<ResponseInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(request.path.clone());
        Ok(ResponseInfo::new(
            200,
            vec![("Server".to_string(), "echo/1.0".to_string())],
            format!("requested {}", request.path),
        ))
    }
}

fn status_matcher(status: u16) -> Matcher {
    serde_yaml::from_str(&format!("type: status\nstatus: [{}]", status)).unwrap()
}

#[test]
fn test_condition_truth_table() {
    let response = ResponseInfo::new(200, Vec::new(), "");
    let hit = status_matcher(200);
    let miss = status_matcher(404);

    let cases = [
        (vec![hit.clone(), hit.clone()], true, true),
        (vec![hit.clone(), miss.clone()], false, true),
        (vec![miss.clone(), miss.clone()], false, false),
    ];
    for (set, and_expected, or_expected) in cases {
        assert_eq!(matchers::matches(&response, &set, "and").unwrap(), and_expected);
        assert_eq!(matchers::matches(&response, &set, "OR").unwrap(), or_expected);
    }

    assert!(matchers::matches(&response, &[], "and").unwrap());
    assert!(!matchers::matches(&response, &[], "or").unwrap());

    assert!(matches!(
        matchers::matches(&response, &[hit], "nand"),
        Err(ScanError::UnsupportedCondition(_))
    ));
}

const ECHO_RULE: &str = r#"
id: echo-token
info:
  name: Echo
  type: test
request:
  path: "/token/{{rand_base(8)}}"
match:
  - matchers-condition: and
    matchers:
      - type: word
        part: body
        words:
          - "/token/{{ rand_base(8) }}"
      - type: dsl
        dsl:
          - 'contains(body, "{{rand_base(8)}}")'
    extractors:
      - type: regex
        part: body
        regex:
          - '/token/({{rand_base(8)}})'
        group: 1
"#;

#[tokio::test]
async fn test_random_token_is_shared_within_one_invocation() {
    let issuer = Arc::new(EchoIssuer::default());
    let engine = TemplateEngine::new(issuer.clone());
    let template = RuleTemplate::from_yaml(ECHO_RULE).unwrap();

    let first = engine.run(&template, LOCALHOST, 80, &ModuleOptions::new()).await.unwrap();
    let second = engine.run(&template, LOCALHOST, 80, &ModuleOptions::new()).await.unwrap();

    let paths = issuer.paths.lock().unwrap().clone();
    assert_eq!(paths.len(), 2);

    for (outcomes, path) in [(&first, &paths[0]), (&second, &paths[1])] {
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].matched);
        let token = path.trim_start_matches("/token/");
        assert_eq!(token.len(), 8);
        assert_eq!(outcomes[0].extracted.as_deref(), Some(token));
    }
    assert_ne!(paths[0], paths[1]);
}

#[tokio::test]
async fn test_stop_at_first_match() {
    let yaml = r#"
id: first-wins
match:
  - stop-at-first-match: true
    matchers:
      - type: status
        status: [200]
  - matchers:
      - type: status
        status: [200]
"#;
    let template = RuleTemplate::from_yaml(yaml).unwrap();
    let engine = TemplateEngine::new(Arc::new(EchoIssuer::default()));

    let outcomes = engine.run(&template, LOCALHOST, 80, &ModuleOptions::new()).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].matched);
}

#[tokio::test]
async fn test_missing_required_option_sends_nothing() {
    let yaml = r#"
id: needs-token
options:
  token:
    required: true
request:
  path: "/api?key={{token}}"
match:
  - matchers:
      - type: status
        status: [200]
"#;
    let template = RuleTemplate::from_yaml(yaml).unwrap();
    let issuer = Arc::new(EchoIssuer::default());
    let engine = TemplateEngine::new(issuer.clone());

    let err = engine
        .run(&template, LOCALHOST, 80, &ModuleOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    match err {
        ScanError::MissingRequiredOption { rule_id, options } => {
            assert_eq!(rule_id, "needs-token");
            assert_eq!(options, vec!["token".to_string()]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);

    let mut options = ModuleOptions::new();
    options.insert("token".to_string(), "abc".to_string());
    engine.run(&template, LOCALHOST, 80, &options).await.unwrap();
    assert_eq!(issuer.paths.lock().unwrap().as_slice(), ["/api?key=abc".to_string()]);
}

#[tokio::test]
async fn test_rejected_expression_fails_before_request() {
    let yaml = r#"
id: hostile
request:
  path: "/{{__import__('os')}}"
match:
  - matchers:
      - type: status
        status: [200]
"#;
    let template = RuleTemplate::from_yaml(yaml).unwrap();
    let issuer = Arc::new(EchoIssuer::default());
    let engine = TemplateEngine::new(issuer.clone());

    let err = engine
        .run(&template, LOCALHOST, 80, &ModuleOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::Evaluation(_)));
    assert!(!err.is_fatal());
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_json_placeholder_extraction() {
    let yaml = r#"
id: api-version
match:
  - matchers:
      - type: word
        words: ['"version"']
    extractors:
      - type: json
        json_path: "Version {version} on {nodes.0}"
"#;
    let template = RuleTemplate::from_yaml(yaml).unwrap();
    let response = ResponseInfo::new(200, Vec::new(), r#"{"version": "7.4", "nodes": ["pve1", "pve2"]}"#);

    let outcomes = TemplateEngine::run_on_response(&template, &response, &ModuleOptions::new()).unwrap();
    assert!(outcomes[0].matched);
    assert_eq!(outcomes[0].extracted.as_deref(), Some("Version 7.4 on pve1"));
}

#[test]
fn test_builtin_fingerprints_recognize_nginx() {
    let response = ResponseInfo::new(
        200,
        vec![("Server".to_string(), "nginx/1.24.0".to_string())],
        "<html></html>",
    );
    let nginx = RuleTemplate::builtin_technologies()
        .unwrap()
        .into_iter()
        .find(|rule| rule.id == "nginx")
        .unwrap();

    let outcomes = TemplateEngine::run_on_response(&nginx, &response, &ModuleOptions::new()).unwrap();
    assert!(outcomes[0].matched);
    assert_eq!(outcomes[0].extracted.as_deref(), Some("1.24.0"));
}

#[tokio::test]
async fn test_scan_reports_only_open_ports() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });

    // Bind and release to get ports that are very likely closed.
    let reserved: Vec<_> = (0..2)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let closed: Vec<u16> = reserved.iter().map(|p| p.local_addr().unwrap().port()).collect();
    drop(reserved);

    let mut services = BTreeMap::new();
    services.insert("http".to_string(), vec![open_port]);
    services.insert("ssh".to_string(), closed.clone());
    let catalog = Arc::new(ServiceCatalog::new(services));

    let ports = PortSelection::parse("ALL").unwrap().resolve(&catalog);
    assert_eq!(ports.len(), 3);

    let options = ScanOptions {
        ports,
        timeout: Duration::from_millis(500),
        ..ScanOptions::default()
    };
    let scanner = Scanner::new(options, catalog, Dispatcher::new(Vec::new(), ModuleOptions::new()));

    let mut trees = Vec::new();
    let summary = scanner.run(vec![LOCALHOST], |tree| trees.push(tree.clone())).await;

    assert_eq!(summary.hosts_up, 1);
    assert_eq!(summary.hosts_closed, 0);
    assert_eq!(summary.open_ports, 1);
    assert!(!summary.cancelled);

    assert_eq!(trees.len(), 1);
    let nodes: Vec<_> = trees[0].open_ports().collect();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].port, open_port);
    assert_eq!(nodes[0].services, vec!["http".to_string()]);
    assert!(nodes[0].banner.is_none());
}

#[tokio::test]
async fn test_cancelled_scan_reports_nothing() {
    let catalog = Arc::new(ServiceCatalog::new(BTreeMap::new()));
    let options = ScanOptions {
        ports: vec![9],
        ..ScanOptions::default()
    };
    let scanner = Scanner::new(options, catalog, Dispatcher::new(Vec::new(), ModuleOptions::new()));
    scanner.cancellation().cancel();

    let mut reported = 0;
    let summary = scanner.run(vec![LOCALHOST], |_| reported += 1).await;
    assert!(summary.cancelled);
    assert_eq!(reported, 0);
}

/// Requests cancellation the second time it runs.
#[derive(Default)]
struct CancelOnSecondRun {
    runs: AtomicUsize,
    flag: Mutex<Option<CancellationFlag>>,
}

#[async_trait]
impl DetectionModule for CancelOnSecondRun {
    fn name(&self) -> &str {
        "cancel-on-second"
    }

    fn portrule(&self) -> &[&str] {
        &["http"]
    }

    fn description(&self) -> &str {
        "cancels the scan"
    }

    async fn run(&self, _ip: IpAddr, _port: u16, _options: &ModuleOptions) -> Result<ModuleOutput> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 1 {
            if let Some(flag) = self.flag.lock().unwrap().as_ref() {
                flag.cancel();
            }
        }
        Ok(ModuleOutput::Line("seen".to_string()))
    }
}

#[tokio::test]
async fn test_partial_host_is_not_reported_after_cancellation() {
    let mut ports = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(listener.local_addr().unwrap().port());
        tokio::spawn(async move { while listener.accept().await.is_ok() {} });
    }

    let mut services = BTreeMap::new();
    services.insert("http".to_string(), ports.clone());
    let catalog = Arc::new(ServiceCatalog::new(services));

    let module = Arc::new(CancelOnSecondRun::default());
    let options = ScanOptions {
        ports,
        max_workers: 1,
        timeout: Duration::from_millis(500),
        ..ScanOptions::default()
    };
    let scanner = Scanner::new(
        options,
        catalog,
        Dispatcher::new(vec![module.clone() as Arc<dyn DetectionModule>], ModuleOptions::new()),
    );
    *module.flag.lock().unwrap() = Some(scanner.cancellation());

    let mut reported = Vec::new();
    let summary = scanner.run(vec![LOCALHOST], |tree| reported.push(tree.clone())).await;

    assert_eq!(module.runs.load(Ordering::SeqCst), 2);
    assert!(summary.cancelled);
    assert!(reported.is_empty());
    assert_eq!(summary.hosts_up, 0);
}

fn mock_target(server: &mockito::ServerGuard) -> (IpAddr, u16) {
    let addr: SocketAddr = server.host_with_port().parse().unwrap();
    (addr.ip(), addr.port())
}

#[tokio::test]
async fn test_http_modules_against_mock_server() {
    let mut server = mockito::Server::new_async().await;
    let page = server
        .mock("GET", "/")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><head><title> Router Login </title></head></html>")
        .create_async()
        .await;
    let head = server
        .mock("HEAD", "/admin")
        .with_status(200)
        .with_header("x-powered-by", "mock")
        .create_async()
        .await;
    let missing = server.mock("GET", "/gone").with_status(404).create_async().await;

    let (ip, port) = mock_target(&server);
    let issuer: Arc<dyn RequestIssuer> = Arc::new(HttpIssuer::new().unwrap());
    let title = HttpTitle::new(Arc::clone(&issuer));
    let headers = HttpHeaders::new(Arc::clone(&issuer));
    let modules: Vec<Arc<dyn DetectionModule>> = vec![Arc::new(title), Arc::new(headers)];

    let mut options = ModuleOptions::new();
    let dispatcher = Dispatcher::new(vec![Arc::clone(&modules[0])], options.clone());
    let reports = dispatcher.dispatch(ip, port, &["http".to_string()]).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].lines, vec!["Title: Router Login\n(Request type: GET)".to_string()]);
    page.assert_async().await;

    options.insert("path".to_string(), "/admin".to_string());
    let dispatcher = Dispatcher::new(vec![Arc::clone(&modules[1])], options.clone());
    let reports = dispatcher.dispatch(ip, port, &["http".to_string()]).await;
    let text = &reports[0].lines[0];
    assert!(text.contains("x-powered-by: mock"));
    assert!(text.ends_with("(Request type: HEAD)"));
    head.assert_async().await;

    options.insert("path".to_string(), "/gone".to_string());
    let dispatcher = Dispatcher::new(vec![Arc::clone(&modules[0])], options);
    let reports = dispatcher.dispatch(ip, port, &["http".to_string()]).await;
    assert_eq!(
        reports[0].lines,
        vec!["Error: Module error: Failed to retrieve content, status code: 404".to_string()]
    );
    missing.assert_async().await;
}

#[test]
fn test_config_roundtrip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("betascan.toml");

    let mut config = Config::default();
    config.scan.max_workers = 32;
    config.scan.ports = "22,80".to_string();
    config.modules.options.insert("path".to_string(), "/status".to_string());
    config.save_to_file(path.to_str().unwrap()).unwrap();

    let loaded = Config::load_from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.scan.max_workers, 32);
    assert_eq!(loaded.scan.ports, "22,80");
    assert_eq!(loaded.scan.host_workers, 100);
    assert_eq!(loaded.modules.options.get("path").map(String::as_str), Some("/status"));
}

#[test]
fn test_rule_directory_loading() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("web");
    std::fs::create_dir(&nested).unwrap();

    std::fs::write(dir.path().join("example.yaml"), "id: example\n").unwrap();
    std::fs::write(dir.path().join("broken.yaml"), "id: [unclosed\n").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "id: not-a-rule\n").unwrap();
    std::fs::write(
        nested.join("panel.yml"),
        "id: admin-panel\ninfo:\n  name: Admin Panel\n  type: panel\n",
    )
    .unwrap();

    let rules = RuleTemplate::load_dir(dir.path()).unwrap();
    let ids: Vec<_> = rules.iter().map(|rule| rule.id.as_str()).collect();
    assert_eq!(ids, vec!["admin-panel"]);

    let registry = ModuleRegistry::builtin(
        Arc::new(EchoIssuer::default()),
        Duration::from_secs(1),
        rules,
    )
    .unwrap();
    assert!(registry.get("admin-panel").is_some());
    assert!(registry.get("http-title").is_some());

    let selected: HashSet<String> = ["technologies".to_string()].into_iter().collect();
    assert!(registry.rules_for(&selected).any(|rule| rule.id == "admin-panel"));
    assert!(registry.rules_for(&selected).any(|rule| rule.id == "nginx"));
}
