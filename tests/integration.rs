//! Integration tests for tunnelctl

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tunnelctl::api::ApiServer;
use tunnelctl::config::{ClientMode, Config, StoreKind};
use tunnelctl::controller::{ApplyOutcome, ClientState, SubprocessController};
use tunnelctl::driver::{LaunchSpec, SystemDriver, WaitPolicy};
use tunnelctl::remote::CoordinationClient;
use tunnelctl::render::{read_proxies, read_sections, RenderOptions};
use tunnelctl::service::TunnelService;
use tunnelctl::session::{Session, SessionCache};
use tunnelctl::store::FileStore;
use tunnelctl::tunnel::TunnelDefinition;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn session(server_url: &str) -> Session {
    Session {
        server_url: server_url.to_string(),
        access_token: "access-token".to_string(),
        tunnel_token: "frp-secret".to_string(),
        user_email: "dev@example.com".to_string(),
        logged_in_at: None,
    }
}

/// Service driving real `sleep` processes in place of frpc
fn subprocess_service(dir: &Path) -> (Arc<TunnelService>, PathBuf, PathBuf) {
    let config_path = dir.join("frpc.ini");
    let pid_file = dir.join("frpc.pid");

    let controller = SubprocessController::new(
        Arc::new(SystemDriver::new()),
        LaunchSpec {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            log_file: None,
        },
        config_path.clone(),
        pid_file.clone(),
        WaitPolicy {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
        },
    );

    let sessions = Arc::new(SessionCache::in_memory());
    sessions.replace(session("http://tunnel.example.com:8000"));

    let service = TunnelService::new(
        Arc::new(FileStore::new(dir.join("tunnels.toml"))),
        sessions,
        Arc::new(CoordinationClient::new(Duration::from_secs(1))),
        Arc::new(controller),
        RenderOptions::default(),
        None,
    );
    (service, config_path, pid_file)
}

/// Coordination server accepting any login, plus an frpc admin API
async fn mock_backends() -> (MockServer, MockServer) {
    let coordination = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-token",
            "user": { "token": "frp-secret" }
        })))
        .mount(&coordination)
        .await;

    let admin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/reload"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&admin)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "http": [
                { "name": "api", "type": "http", "status": "running", "err": "" }
            ]
        })))
        .mount(&admin)
        .await;

    (coordination, admin)
}

fn admin_config(dir: &Path, coordination: &MockServer, admin: &MockServer) -> Config {
    let mut config = Config::default();
    config.client.mode = ClientMode::Admin;
    config.client.admin_url = admin.uri();
    config.client.config_path = dir.join("frpc.ini").to_string_lossy().into_owned();
    config.client.pid_file = dir.join("frpc.pid").to_string_lossy().into_owned();
    config.store.kind = StoreKind::File;
    config.store.file = dir.join("tunnels.toml").to_string_lossy().into_owned();
    config.store.server_url = Some(coordination.uri());
    config.credentials.persist = false;
    config
}

/// Serve the control API on an ephemeral port
async fn start_api(
    service: Arc<TunnelService>,
    auth_token: Option<&str>,
) -> (String, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ApiServer::new(addr, service, shutdown_rx, auth_token.map(str::to_string));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (format!("http://{}", addr), shutdown_tx)
}

#[tokio::test]
async fn test_create_tunnel_reaches_running_client() {
    let dir = tempfile::tempdir().unwrap();
    let (service, config_path, pid_file) = subprocess_service(dir.path());

    let synced = service
        .create_tunnel(TunnelDefinition::http("api", 8080, "api"))
        .await
        .unwrap();
    assert_eq!(synced.applied, Some(ApplyOutcome::Written));

    let status = service.start().await.unwrap();
    assert!(status.running);
    assert!(pid_file.exists());

    let synced = service
        .create_tunnel(TunnelDefinition::tcp("db", 5432, 15432))
        .await
        .unwrap();
    assert_eq!(synced.applied, Some(ApplyOutcome::Restarted));

    let text = std::fs::read_to_string(&config_path).unwrap();
    let sections = read_sections(&text);
    assert_eq!(sections[0].name, "common");
    assert_eq!(sections[0].get("server_addr"), Some("tunnel.example.com"));
    assert_eq!(sections[0].get("token"), Some("frp-secret"));

    let api = sections.iter().find(|s| s.name == "api").unwrap();
    assert_eq!(api.get("type"), Some("http"));
    assert_eq!(api.get("local_port"), Some("8080"));
    assert_eq!(api.get("subdomain"), Some("api"));

    let status = service.status().await;
    assert!(status.running);
    let mut names: Vec<_> = status.proxies.iter().map(|p| p.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["api", "db"]);

    let status = service.stop().await.unwrap();
    assert_eq!(status.state, ClientState::Stopped);
    assert!(!pid_file.exists());
}

#[tokio::test]
async fn test_delete_tunnel_removes_section() {
    let dir = tempfile::tempdir().unwrap();
    let (service, config_path, _) = subprocess_service(dir.path());

    let web = service
        .create_tunnel(TunnelDefinition::http("web", 3000, "web"))
        .await
        .unwrap()
        .value;
    service
        .create_tunnel(TunnelDefinition::tcp("db", 5432, 15432))
        .await
        .unwrap();

    service.delete_tunnel(web.id).await.unwrap();

    let text = std::fs::read_to_string(&config_path).unwrap();
    let names: Vec<_> = read_proxies(&text).into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["db"]);
}

#[tokio::test]
async fn test_concurrent_creates_all_land_in_config() {
    let dir = tempfile::tempdir().unwrap();
    let (service, config_path, _) = subprocess_service(dir.path());

    let mut handles = Vec::new();
    for i in 0..5u32 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let name = format!("svc{}", i);
            service
                .create_tunnel(TunnelDefinition::http(&name, 8000 + i, &name))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let text = std::fs::read_to_string(&config_path).unwrap();
    assert_eq!(read_proxies(&text).len(), 5);
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _, _) = subprocess_service(dir.path());
    service
        .create_tunnel(TunnelDefinition::http("api", 8080, "api"))
        .await
        .unwrap();

    let first = service.start().await.unwrap().pid.unwrap();
    let second = service.restart().await.unwrap().pid.unwrap();
    assert_ne!(first, second);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_api_login_autostarts_admin_client() {
    let dir = tempfile::tempdir().unwrap();
    let (coordination, admin) = mock_backends().await;
    let config = admin_config(dir.path(), &coordination, &admin);
    let service = TunnelService::from_config(&config);
    let (base, shutdown) = start_api(Arc::clone(&service), None).await;
    let http = reqwest::Client::new();

    let body: Value = http
        .get(format!("{}/api/config", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["server_configured"], true);
    assert_eq!(body["server_url"], coordination.uri());

    // Accepted but deferred: nothing can be rendered without a token
    let response = http
        .post(format!("{}/api/tunnels", base))
        .json(&json!({ "name": "api", "type": "http", "local_port": 8080, "subdomain": "api" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["name"], "api");
    assert_eq!(body["applied"], "deferred");

    let response = http
        .post(format!("{}/api/login", base))
        .json(&json!({ "email": "dev@example.com", "password": "pw" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["email"], "dev@example.com");
    assert!(body.get("access_token").is_none());

    let status: Value = http
        .get(format!("{}/api/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["mode"], "admin");
    assert_eq!(status["state"], "running");
    assert_eq!(status["running"], true);
    assert_eq!(status["proxies"][0]["name"], "api");

    let text = std::fs::read_to_string(dir.path().join("frpc.ini")).unwrap();
    let sections = read_sections(&text);
    assert_eq!(sections[0].get("token"), Some("frp-secret"));
    let admin_port = admin.address().port().to_string();
    assert_eq!(sections[0].get("admin_port"), Some(admin_port.as_str()));
    assert_eq!(read_proxies(&text)[0].name, "api");

    let response = http
        .post(format!("{}/api/logout", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(!service.sessions().is_authenticated());
    // Drained, not deleted: frpc keeps running with no proxies
    let text = std::fs::read_to_string(dir.path().join("frpc.ini")).unwrap();
    assert!(read_proxies(&text).is_empty());

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_api_rejects_invalid_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let (coordination, admin) = mock_backends().await;
    let config = admin_config(dir.path(), &coordination, &admin);
    let service = TunnelService::from_config(&config);
    let (base, shutdown) = start_api(Arc::clone(&service), None).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/api/tunnels", base))
        .json(&json!({ "name": "db", "type": "tcp", "local_port": 5432 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(
        response.headers().get("x-tunnelctl-error").unwrap(),
        "INVALID_TUNNEL"
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_TUNNEL");

    let body: Value = http
        .get(format!("{}/api/tunnels", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["tunnels"], json!([]));

    let response = http
        .post(format!("{}/api/tunnels", base))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = http
        .delete(format!("{}/api/tunnels/99", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_api_bulk_import_reports_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let (coordination, admin) = mock_backends().await;
    let config = admin_config(dir.path(), &coordination, &admin);
    let service = TunnelService::from_config(&config);
    service
        .login(None, "dev@example.com", "pw")
        .await
        .unwrap();
    let (base, shutdown) = start_api(Arc::clone(&service), None).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/tunnels/import", base))
        .json(&json!([
            { "name": "a", "type": "http", "local_port": 8080, "subdomain": "a" },
            { "name": "a", "type": "http", "local_port": 8081, "subdomain": "b" }
        ]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["created"], json!(["a"]));
    assert_eq!(body["failed"], json!([{ "name": "a", "error": "duplicate" }]));

    let text = std::fs::read_to_string(dir.path().join("frpc.ini")).unwrap();
    assert_eq!(read_proxies(&text).len(), 1);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_api_bulk_import_keeps_valid_records() {
    let dir = tempfile::tempdir().unwrap();
    let (coordination, admin) = mock_backends().await;
    let config = admin_config(dir.path(), &coordination, &admin);
    let service = TunnelService::from_config(&config);
    service
        .login(None, "dev@example.com", "pw")
        .await
        .unwrap();
    let (base, shutdown) = start_api(Arc::clone(&service), None).await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/tunnels/import", base))
        .json(&json!({
            "tunnels": [
                { "name": "a", "type": "http", "local_port": 8080, "subdomain": "a" },
                { "name": "b", "type": "ftp", "local_port": 21 },
                { "name": "c", "type": "tcp", "local_port": "22", "remote_port": 2222 }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["created"], json!(["a"]));
    let failed = body["failed"].as_array().unwrap();
    let names: Vec<&str> = failed.iter().filter_map(|f| f["name"].as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);

    let text = std::fs::read_to_string(dir.path().join("frpc.ini")).unwrap();
    assert_eq!(read_proxies(&text).len(), 1);
    assert_eq!(service.list_tunnels().await.unwrap().len(), 1);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_api_bearer_token() {
    let dir = tempfile::tempdir().unwrap();
    let (coordination, admin) = mock_backends().await;
    let config = admin_config(dir.path(), &coordination, &admin);
    let service = TunnelService::from_config(&config);
    let (base, shutdown) = start_api(service, Some("s3cret")).await;
    let http = reqwest::Client::new();

    let response = http.get(format!("{}/api/status", base)).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let response = http
        .get(format!("{}/api/status", base))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    for open in ["/health", "/version", "/api/config", "/api/auth/status"] {
        let response = http.get(format!("{}{}", base, open)).send().await.unwrap();
        assert_eq!(response.status(), 200, "{} should not need a token", open);
    }

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_expired_session_is_cleared_by_auth_status() {
    let dir = tempfile::tempdir().unwrap();
    let (coordination, admin) = mock_backends().await;
    Mock::given(method("GET"))
        .and(path("/api/tunnels"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "detail": "expired" })))
        .mount(&coordination)
        .await;

    let config = admin_config(dir.path(), &coordination, &admin);
    let service = TunnelService::from_config(&config);
    service
        .login(None, "dev@example.com", "pw")
        .await
        .unwrap();
    assert!(service.sessions().is_authenticated());

    let status = service.auth_status().await;
    assert!(!status.authenticated);
    assert!(!service.sessions().is_authenticated());
}
