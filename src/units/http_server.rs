//! The HTTP surface: metrics exposition and operational endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::center::{Center, VERSION};
use crate::config::Config;
use crate::metrics;
use crate::units::scanner::{self, Scanner};

/// The embedded favicon: a simple padlock.
const FAVICON_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 32 32" width="32" height="32">
  <rect x="8" y="15" width="16" height="14" rx="2" fill="#ffd700" stroke="#d4911a" stroke-width="1.5"/>
  <path d="M 12 15 L 12 10 Q 12 5 16 5 Q 20 5 20 10 L 20 15" fill="none" stroke="#d4911a" stroke-width="2.5" stroke-linecap="round"/>
  <circle cx="16" cy="21" r="2" fill="#d4911a"/>
  <rect x="15" y="21" width="2" height="4" fill="#d4911a" rx="1"/>
</svg>"##;

//------------ HttpServer ----------------------------------------------------

pub struct HttpServer {
    pub center: Arc<Center>,
    pub scanner: Arc<Scanner>,
}

struct HttpState {
    center: Arc<Center>,
    scanner: Arc<Scanner>,
}

impl HttpServer {
    /// Build the application router.
    pub fn router(center: Arc<Center>, scanner: Arc<Scanner>) -> Router {
        let state = Arc::new(HttpState { center, scanner });
        Router::new()
            .route("/", get(Self::root))
            .route("/favicon.ico", get(Self::favicon))
            .route("/metrics", get(Self::metrics))
            .route("/healthz", get(Self::healthz))
            .route("/scan", get(Self::scan))
            .route("/config", get(Self::config_view))
            .route("/cache/stats", get(Self::cache_stats))
            .route("/cache/clear", post(Self::cache_clear))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                Self::ip_allowlist,
            ))
            .with_state(state)
    }

    /// Serve until the shutdown future resolves.
    pub async fn run(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), String> {
        let app = Self::router(self.center, self.scanner);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| err.to_string())
    }

    /// Enforce the IP allow-list on every request.
    ///
    /// A request without a determinable client address is allowed with a
    /// warning.
    async fn ip_allowlist(
        State(state): State<Arc<HttpState>>,
        request: Request,
        next: Next,
    ) -> Response {
        let config = state.center.config.load();
        if !config.enable_ip_whitelist {
            return next.run(request).await;
        }

        let connect_info = request.extensions().get::<ConnectInfo<SocketAddr>>().copied();
        let Some(ConnectInfo(addr)) = connect_info else {
            warn!("Unable to determine client IP address, allowing request");
            return next.run(request).await;
        };

        let client_ip = addr.ip();
        if config.ip_allowed(client_ip) {
            debug!("Access granted for IP address: {client_ip}");
            return next.run(request).await;
        }

        warn!("Access denied for IP address: {client_ip}");
        (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "Access forbidden",
                "message": "Your IP address is not allowed to access this service",
                "client_ip": client_ip.to_string(),
            })),
        )
            .into_response()
    }

    async fn metrics(State(state): State<Arc<HttpState>>) -> Response {
        match state.center.metrics.assemble() {
            Ok(text) => ([(header::CONTENT_TYPE, metrics::CONTENT_TYPE)], text).into_response(),
            Err(err) => {
                error!("Failed to generate metrics: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"detail": "Failed to generate metrics"})),
                )
                    .into_response()
            }
        }
    }

    async fn healthz(State(state): State<Arc<HttpState>>) -> Response {
        let mut health = Map::new();

        merge_object(
            &mut health,
            serde_json::to_value(state.scanner.health_status()).unwrap_or_default(),
        );
        merge_object(
            &mut health,
            serde_json::to_value(state.center.cache.health_status().await).unwrap_or_default(),
        );
        merge_object(&mut health, state.center.metrics.registry_status());
        merge_object(&mut health, system_health(&state.center));

        health.insert("status".into(), json!("healthy"));
        health.insert("version".into(), json!(VERSION));
        Json(Value::Object(health)).into_response()
    }

    async fn scan(State(state): State<Arc<HttpState>>) -> Response {
        if state.center.config.load().dry_run {
            return Json(json!({"message": "Scan not performed - dry run mode enabled"}))
                .into_response();
        }
        info!("Manual scan triggered via API");
        let outcome = state.scanner.scan_once().await;
        Json(outcome).into_response()
    }

    async fn config_view(State(state): State<Arc<HttpState>>) -> Response {
        let config = state.center.config.load_full();
        match serde_json::to_value(&*config) {
            Ok(Value::Object(mut map)) => {
                redact_config(&mut map, &config);
                Json(Value::Object(map)).into_response()
            }
            _ => {
                error!("Failed to serialize configuration");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"detail": "Failed to get configuration"})),
                )
                    .into_response()
            }
        }
    }

    async fn cache_stats(State(state): State<Arc<HttpState>>) -> Response {
        Json(state.center.cache.stats().await).into_response()
    }

    async fn cache_clear(State(state): State<Arc<HttpState>>) -> Response {
        if state.center.config.load().dry_run {
            return Json(json!({"message": "Cache not cleared - dry run mode enabled"}))
                .into_response();
        }
        state.center.cache.clear().await;
        info!("Cache cleared via API");
        Json(json!({"message": "Cache cleared successfully"})).into_response()
    }

    async fn favicon() -> Response {
        ([(header::CONTENT_TYPE, "image/svg+xml")], FAVICON_SVG).into_response()
    }

    async fn root(State(state): State<Arc<HttpState>>) -> Html<String> {
        let config = state.center.config.load_full();
        Html(landing_page(&config))
    }
}

/// Merge a JSON object's keys into the target map.
fn merge_object(target: &mut Map<String, Value>, value: Value) {
    if let Value::Object(map) = value {
        target.extend(map);
    }
}

/// Config-file and disk-space fragments of the health endpoint.
fn system_health(center: &Center) -> Value {
    let config = center.config.load_full();
    let mut health = Map::new();

    let config_file_exists = center
        .config_path
        .as_ref()
        .map(|path| path.exists())
        .unwrap_or(false);
    let config_file_writable = config_file_exists
        && center
            .config_path
            .as_ref()
            .and_then(|path| std::fs::metadata(path).ok())
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false);

    health.insert(
        "config_file".into(),
        center
            .config_path
            .as_ref()
            .map(|path| json!(path))
            .unwrap_or_else(|| json!("default")),
    );
    health.insert("config_file_exists".into(), json!(config_file_exists));
    health.insert("config_file_writable".into(), json!(config_file_writable));
    health.insert("hot_reload_enabled".into(), json!(config.hot_reload));

    let log_file_writable = match &config.log_file {
        Some(path) => path
            .parent()
            .map(|dir| dir.exists())
            .unwrap_or(true),
        None => true,
    };
    health.insert("log_file_writable".into(), json!(log_file_writable));

    let mut min_free: Option<u64> = None;
    let mut checked = 0usize;
    for directory in &config.certificate_directories {
        if !directory.exists() {
            continue;
        }
        let usage = scanner::disk_usage(directory);
        let dir_key = directory.as_str().replace(['/', '\\'], "_");
        let percent_used = if usage.total > 0 {
            (usage.used as f64 / usage.total as f64 * 10000.0).round() / 100.0
        } else {
            0.0
        };
        health.insert(
            format!("diskspace_{dir_key}"),
            json!({
                "total": usage.total,
                "used": usage.used,
                "free": usage.free,
                "percent_used": percent_used,
            }),
        );
        checked += 1;
        min_free = Some(min_free.map_or(usage.free, |free| free.min(usage.free)));
    }

    if let Some(min_free) = min_free {
        health.insert(
            "diskspace".into(),
            json!({
                // Less than a gigabyte free is worth flagging.
                "status": if min_free > 1024 * 1024 * 1024 { "ok" } else { "warning" },
                "min_free_bytes": min_free,
                "directories_checked": checked,
            }),
        );
    }

    Value::Object(health)
}

/// Apply the sensitive-value redactions to the serialized configuration.
fn redact_config(map: &mut Map<String, Value>, config: &Config) {
    map.insert(
        "p12_passwords".into(),
        json!([format!(
            "***REDACTED*** ({} passwords)",
            config.p12_passwords.len()
        )]),
    );
    map.insert("tls_key".into(), json!("***REDACTED***"));
    map.insert(
        "allowed_ips".into(),
        json!([format!(
            "***REDACTED*** ({} IPs/networks)",
            config.allowed_ips.len()
        )]),
    );
    map.insert(
        "certificate_directories".into(),
        json!(config
            .certificate_directories
            .iter()
            .map(|dir| format!("***/{}", dir.file_name().unwrap_or_default()))
            .collect::<Vec<_>>()),
    );
}

/// Render the landing page from the current configuration snapshot.
fn landing_page(config: &Config) -> String {
    let protocol = if config.tls_cert.is_some() && config.tls_key.is_some() {
        "https"
    } else {
        "http"
    };
    let server_url = format!("{protocol}://{}:{}", config.bind_address, config.port);
    let directories = config
        .certificate_directories
        .iter()
        .map(|dir| format!("<li><code>{dir}</code></li>"))
        .collect::<Vec<_>>()
        .join("\n      ");

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>TLS Certificate Monitor</title>
  <meta charset="utf-8">
  <style>
    body {{ font-family: sans-serif; max-width: 840px; margin: 40px auto; padding: 0 16px; line-height: 1.5; }}
    h1 {{ border-bottom: 3px solid #4CAF50; padding-bottom: 12px; }}
    .endpoint {{ margin: 12px 0; padding: 10px 14px; background: #f6f6f6; border-left: 4px solid #4CAF50; }}
    code {{ background: #ececec; padding: 2px 6px; border-radius: 3px; }}
    table {{ border-collapse: collapse; }}
    td {{ padding: 4px 14px 4px 0; }}
  </style>
</head>
<body>
  <h1>TLS Certificate Monitor v{version}</h1>
  <div class="endpoint"><a href="/metrics">/metrics</a> &mdash; Prometheus metrics</div>
  <div class="endpoint"><a href="/healthz">/healthz</a> &mdash; health and disk status</div>
  <div class="endpoint"><a href="/scan">/scan</a> &mdash; trigger a manual scan</div>
  <div class="endpoint"><a href="/config">/config</a> &mdash; current configuration (redacted)</div>
  <div class="endpoint"><a href="/cache/stats">/cache/stats</a> &mdash; cache statistics</div>
  <div class="endpoint"><code>POST /cache/clear</code> &mdash; clear the parse cache</div>
  <h2>Configuration</h2>
  <table>
    <tr><td>Server</td><td><code>{server_url}</code></td></tr>
    <tr><td>Scan interval</td><td><code>{scan_interval}</code></td></tr>
    <tr><td>Workers</td><td><code>{workers}</code></td></tr>
    <tr><td>Hot reload</td><td><code>{hot_reload}</code></td></tr>
    <tr><td>Cache type</td><td><code>{cache_type:?}</code></td></tr>
    <tr><td>Cache TTL</td><td><code>{cache_ttl}</code></td></tr>
    <tr><td>Log level</td><td><code>{log_level:?}</code></td></tr>
  </table>
  <h2>Monitored directories</h2>
  <ul>
      {directories}
  </ul>
</body>
</html>
"#,
        version = VERSION,
        server_url = server_url,
        scan_interval = config.scan_interval,
        workers = config.workers,
        hot_reload = if config.hot_reload { "enabled" } else { "disabled" },
        cache_type = config.cache_type,
        cache_ttl = config.cache_ttl,
        log_level = config.log_level,
        directories = directories,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::test_support::{cert_pem, CertSpec};
    use crate::config::CacheType;
    use axum::body::Body;
    use camino::Utf8PathBuf;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn tmpdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn test_router(dir: &Utf8PathBuf, mutate: impl FnOnce(&mut Config)) -> (Arc<Center>, Router) {
        let mut config = Config {
            certificate_directories: vec![dir.clone()],
            cache_type: CacheType::Memory,
            workers: 2,
            hot_reload: false,
            ..Default::default()
        };
        mutate(&mut config);
        let center = Center::new(config, None, None);
        let scanner = Scanner::new(center.clone());
        let router = HttpServer::router(center.clone(), scanner);
        (center, router)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_exposition_text() {
        let (_guard, dir) = tmpdir();
        std::fs::write(
            dir.join("a.pem"),
            cert_pem(&CertSpec {
                cn: "a.example",
                ..Default::default()
            }),
        )
        .unwrap();

        let (center, router) = test_router(&dir, |_| ());
        let scanner = Scanner::new(center.clone());
        scanner.scan_once().await;

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("ssl_cert_expiration_timestamp{common_name=\"a.example\""));
        assert!(text.contains("ssl_certs_parsed_total 1"));
    }

    #[tokio::test]
    async fn healthz_merges_component_snapshots() {
        let (_guard, dir) = tmpdir();
        let (_center, router) = test_router(&dir, |_| ());

        let (status, body) = get_json(router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], VERSION);
        assert_eq!(body["cert_scan_status"], "stopped");
        assert!(body["cache_hit_rate"].is_number());
        assert!(body["prometheus_registry"]["metrics_count"].is_number());
        assert_eq!(body["hot_reload_enabled"], false);
    }

    #[tokio::test]
    async fn scan_returns_the_full_outcome() {
        let (_guard, dir) = tmpdir();
        std::fs::write(dir.join("a.pem"), cert_pem(&CertSpec::default())).unwrap();
        let (_center, router) = test_router(&dir, |_| ());

        let (status, body) = get_json(router, "/scan").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["total_parsed"], 1);
        assert_eq!(body["summary"]["directories_scanned"], 1);
        assert!(body["timestamp"].is_number());
        assert_eq!(body["directories"][0]["certificates_parsed"], 1);
    }

    #[tokio::test]
    async fn scan_is_a_no_op_in_dry_run_mode() {
        let (_guard, dir) = tmpdir();
        let (_center, router) = test_router(&dir, |config| config.dry_run = true);

        let (status, body) = get_json(router, "/scan").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Scan not performed - dry run mode enabled");
    }

    #[tokio::test]
    async fn config_view_redacts_sensitive_values() {
        let (_guard, dir) = tmpdir();
        let (_center, router) = test_router(&dir, |config| {
            config.tls_key = Some("/etc/tls/server.key".into());
            config.allowed_ips = vec!["127.0.0.1".into(), "::1".into(), "10.0.0.0/8".into()];
        });

        let (status, body) = get_json(router, "/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_json_diff::assert_json_include!(
            actual: body.clone(),
            expected: json!({
                "tls_key": "***REDACTED***",
                "workers": 2,
                "enable_ip_whitelist": true,
            })
        );
        assert_eq!(body["tls_key"], "***REDACTED***");
        assert_eq!(body["p12_passwords"][0], "***REDACTED*** (4 passwords)");
        assert_eq!(body["allowed_ips"][0], "***REDACTED*** (3 IPs/networks)");
        let first_dir = body["certificate_directories"][0].as_str().unwrap();
        assert!(first_dir.starts_with("***/"));
        assert!(!first_dir.contains("/tmp"));
        // Non-sensitive settings pass through unredacted.
        assert_eq!(body["workers"], 2);
        assert_eq!(body["scan_interval"], "5m");
    }

    #[tokio::test]
    async fn cache_endpoints_report_and_clear() {
        let (_guard, dir) = tmpdir();
        std::fs::write(dir.join("a.pem"), cert_pem(&CertSpec::default())).unwrap();
        let (center, router) = test_router(&dir, |_| ());

        let scanner = Scanner::new(center.clone());
        scanner.scan_once().await;

        let (status, body) = get_json(router.clone(), "/cache/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entries_total"], 1);

        let response = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/cache/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (_, body) = get_json(router, "/cache/stats").await;
        assert_eq!(body["entries_total"], 0);
    }

    #[tokio::test]
    async fn allow_list_rejects_unknown_addresses() {
        let (_guard, dir) = tmpdir();
        let (_center, router) = test_router(&dir, |config| {
            config.allowed_ips = vec!["127.0.0.1".into(), "::1".into(), "192.168.0.0/16".into()];
        });

        let request = |addr: &str| {
            axum::http::Request::builder()
                .uri("/healthz")
                .extension(ConnectInfo(addr.parse::<SocketAddr>().unwrap()))
                .body(Body::empty())
                .unwrap()
        };

        // Localhost is always allowed.
        let response = router.clone().oneshot(request("127.0.0.1:4242")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // CIDR containment.
        let response = router.clone().oneshot(request("192.168.3.9:4242")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Everything else is rejected with a JSON body naming the client.
        let response = router.clone().oneshot(request("10.1.2.3:4242")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Access forbidden");
        assert_eq!(value["client_ip"], "10.1.2.3");
    }

    #[tokio::test]
    async fn allow_list_can_be_disabled() {
        let (_guard, dir) = tmpdir();
        let (_center, router) = test_router(&dir, |config| {
            config.enable_ip_whitelist = false;
        });

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .extension(ConnectInfo("10.1.2.3:4242".parse::<SocketAddr>().unwrap()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn requests_without_client_address_are_allowed() {
        let (_guard, dir) = tmpdir();
        let (_center, router) = test_router(&dir, |_| ());

        let (status, _) = get_json(router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn landing_page_and_favicon_render() {
        let (_guard, dir) = tmpdir();
        let (_center, router) = test_router(&dir, |_| ());

        let response = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("/metrics"));
        assert!(html.contains("TLS Certificate Monitor"));

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/favicon.ico")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/svg+xml"
        );
    }
}
