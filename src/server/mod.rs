//! HTTP worker for webfleet.
//!
//! Every worker process runs the same axum application on the listening
//! socket it inherited from the supervisor. Requests flow through shared
//! stages (request id, compression, error pages, view rendering) and then the
//! stages each route module declares.
//!
//! # Example
//!
//! ```bash
//! # Local mode: one worker, memory sessions, request logging
//! webfleet serve --dev --port 3000
//!
//! curl -i http://localhost:3000/
//! curl -i -d username=ada -c jar http://localhost:3000/login
//! curl -i -b jar http://localhost:3000/secure
//! curl -i http://localhost:3000/errors/503
//! ```

pub mod body;
pub mod error;
pub mod middleware;
pub mod reply;
pub mod security;
pub mod session;
pub mod store;
pub mod views;

use std::sync::Arc;

use axum::{
    Router,
    extract::Path,
    handler::HandlerWithoutStateExt,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::{CompressionLayer, predicate::SizeAbove};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{ServerConfig, StoreKind};
use crate::error::{FleetError, Result};
use crate::routes::{self, RouteModule, StageBundle};
use crate::supervisor::take_inherited_listener;
use error::StageError;
use reply::Reply;
use session::CookieSigner;
use store::SessionStore;
use views::{TemplateEngine, Views};

/// Responses smaller than this are sent uncompressed.
const COMPRESSION_THRESHOLD: u16 = 1024;

/// Shared application state.
pub struct AppState {
    pub config: ServerConfig,
    pub signer: CookieSigner,
    pub store: Arc<dyn SessionStore>,
    pub views: Arc<dyn TemplateEngine>,
}

impl AppState {
    /// Build state for `config`: the configured session store, a cookie
    /// signer keyed with the session secret, and the view set.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store = store::build_store(&config.session)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let views = Views::new(
            config.views_dir.clone(),
            config.environment.is_production(),
        );
        Ok(Self {
            signer: CookieSigner::new(&config.session.secret)?,
            store,
            views: Arc::new(views),
            config,
        })
    }
}

/// Build the application router with every route module in [`routes::ROUTES`].
pub fn build_router(state: Arc<AppState>) -> Router {
    build_router_with(state, routes::ROUTES)
}

/// Build the application router for `modules`.
///
/// Requests that match no route fall through to the static directory and
/// then to the 404 view, as do requests whose method a known path does not
/// accept. In development every request is logged.
pub fn build_router_with(state: Arc<AppState>, modules: &[RouteModule]) -> Router {
    let stages = StageBundle::new(state.clone());
    let static_files = ServeDir::new(&state.config.static_dir)
        .call_fallback_on_method_not_allowed(true)
        .fallback(not_found.into_service());

    let mut app = routes::mount_all(Router::new(), modules, &stages)
        .route("/errors/{code}", get(error_probe))
        .method_not_allowed_fallback(not_found)
        .fallback_service(static_files)
        .layer(from_fn_with_state(state.clone(), middleware::render_stage))
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .layer(from_fn_with_state(state.clone(), middleware::error_stage));

    if !state.config.environment.is_production() {
        app = app.layer(from_fn_with_state(
            middleware::LogPrefix::default(),
            middleware::request_log,
        ));
    }

    let app = app
        .layer(CompressionLayer::new().compress_when(SizeAbove::new(COMPRESSION_THRESHOLD)))
        .layer(from_fn(middleware::request_id_stage))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Layers on `app` run after routing, so the override wraps it from outside
    Router::new()
        .fallback_service(app)
        .layer(from_fn(middleware::method_override_stage))
}

async fn not_found() -> Reply {
    Reply::not_found()
}

/// Render the generic error view with the status named in the path.
async fn error_probe(Path(code): Path<String>) -> std::result::Result<Reply, StageError> {
    error!("Error page requested for status code {}", code);
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| {
            StageError::with_status(
                StatusCode::BAD_REQUEST,
                format!("'{}' is not an HTTP status code", code),
            )
        })?;
    Ok(Reply::serve("errors/generic", json!({})).with_status(status))
}

/// Run one HTTP worker until it is told to stop.
///
/// Uses the listening socket inherited from the supervisor when there is one
/// and binds `config.bind_addr()` otherwise.
pub async fn run_worker(config: ServerConfig) -> Result<()> {
    let pid = std::process::id();
    let listener = match take_inherited_listener()? {
        Some(listener) => tokio::net::TcpListener::from_std(listener)?,
        None => tokio::net::TcpListener::bind(config.bind_addr()).await?,
    };
    let addr = listener.local_addr()?;

    match config.session.store {
        StoreKind::Memory if config.environment.is_production() => warn!(
            pid,
            "Using the memory session store; sessions are not shared between workers"
        ),
        StoreKind::Memory => info!(pid, "Using the memory session store"),
        StoreKind::File => info!(pid, "Using the file session store"),
    }

    let state = Arc::new(AppState::new(config)?);
    let reaper = store::start_reaper(state.store.clone(), store::REAP_INTERVAL);
    let app = build_router(state);

    info!(pid, address = %addr, "Web server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(FleetError::Io)?;
    reaper.abort();
    info!(pid, "Web server stopped");

    Ok(())
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEV_COOKIE_NAME, DEV_SESSION_SECRET, Environment, SessionSettings};
    use crate::server::body::BODY_LIMIT;
    use crate::server::reply::DEFAULT_CACHE_CONTROL;
    use crate::server::session::X_RESPONSE_TIME;
    use crate::server::store::{MemoryStore, SessionError, SessionRecord};
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, Response, header},
        routing::get,
    };
    use serde_json::Value;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_config(static_dir: PathBuf, environment: Environment) -> ServerConfig {
        ServerConfig {
            environment,
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 1,
            static_dir,
            views_dir: None,
            session: SessionSettings {
                cookie_name: DEV_COOKIE_NAME,
                secure: environment.is_production(),
                secret: DEV_SESSION_SECRET.to_string(),
                store: StoreKind::Memory,
                dir: None,
                ttl: Duration::from_secs(3600),
            },
        }
    }

    struct TestApp {
        router: Router,
        _static_dir: TempDir,
    }

    impl TestApp {
        fn new() -> Self {
            Self::build(Environment::Development, Arc::new(MemoryStore::new()), routes::ROUTES)
        }

        fn build(
            environment: Environment,
            store: Arc<dyn SessionStore>,
            modules: &[RouteModule],
        ) -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("site.css"), "body { color: red; }").unwrap();
            let state = AppState::with_store(test_config(dir.path().to_path_buf(), environment), store)
                .unwrap();
            Self {
                router: build_router_with(Arc::new(state), modules),
                _static_dir: dir,
            }
        }

        async fn send(&self, request: Request<Body>) -> Response<Body> {
            self.router.clone().oneshot(request).await.unwrap()
        }

        async fn get(&self, uri: &str, cookie: Option<&str>) -> Response<Body> {
            let mut builder = Request::builder().uri(uri);
            if let Some(cookie) = cookie {
                builder = builder.header(header::COOKIE, cookie);
            }
            self.send(builder.body(Body::empty()).unwrap()).await
        }

        async fn post_form(&self, uri: &str, form: &str, cookie: Option<&str>) -> Response<Body> {
            let mut builder = Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
            if let Some(cookie) = cookie {
                builder = builder.header(header::COOKIE, cookie);
            }
            self.send(builder.body(Body::from(form.to_string())).unwrap())
                .await
        }

        /// Log in and return the session cookie to send back.
        async fn login(&self, user: &str) -> String {
            let response = self
                .post_form("/login", &format!("username={}", user), None)
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            session_cookie(&response).expect("login sets a session cookie")
        }
    }

    fn session_cookie(response: &Response<Body>) -> Option<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with(DEV_COOKIE_NAME))
            .and_then(|v| v.split(';').next())
            .map(String::from)
    }

    async fn text(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        serde_json::from_str(&text(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_index_renders_view() {
        let app = TestApp::new();
        let response = app.get("/", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            DEFAULT_CACHE_CONTROL
        );
        assert!(response.headers().contains_key(X_RESPONSE_TIME));
        assert!(response.headers().contains_key("x-request-id"));
        assert!(text(response).await.contains("<h1>webfleet</h1>"));
    }

    #[tokio::test]
    async fn test_unknown_path_renders_404() {
        let app = TestApp::new();
        let response = app.get("/no/such/page", None).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(text(response).await.contains("Nothing lives at /no/such/page"));
    }

    #[tokio::test]
    async fn test_any_method_on_unknown_path_renders_404() {
        let app = TestApp::new();
        for method in ["POST", "PUT", "DELETE"] {
            let response = app
                .send(
                    Request::builder()
                        .method(method)
                        .uri("/no/such")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await;

            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", method);
            assert!(text(response).await.contains("Nothing lives at /no/such"));
        }
    }

    #[tokio::test]
    async fn test_unsupported_method_on_known_path_renders_404() {
        let app = TestApp::new();
        let cases = [
            ("GET", "/login"),
            ("DELETE", "/"),
            ("PUT", "/secure/notes"),
            ("POST", "/errors/500"),
        ];
        for (method, uri) in cases {
            let response = app
                .send(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await;

            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{} {}", method, uri);
            assert!(
                text(response)
                    .await
                    .contains(&format!("Nothing lives at {}", uri))
            );
        }
    }

    #[tokio::test]
    async fn test_method_override_reaches_route() {
        let app = TestApp::new();
        let cookie = app.login("ada").await;

        let response = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/secure/notes")
                    .header(header::COOKIE, &cookie)
                    .header("x-http-method-override", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["notes"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_static_files_are_served() {
        let app = TestApp::new();
        let response = app.get("/site.css", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "body { color: red; }");
    }

    #[tokio::test]
    async fn test_secure_requires_login() {
        let app = TestApp::new();
        let response = app.get("/secure", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_grants_secure_access() {
        let app = TestApp::new();
        let cookie = app.login("ada").await;

        let response = app.get("/secure", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"user": "ada", "success": true})
        );
    }

    #[tokio::test]
    async fn test_forged_cookie_is_anonymous() {
        let app = TestApp::new();
        let cookie = app.login("ada").await;
        let forged = format!("{}x", cookie);

        let response = app.get("/secure", Some(&forged)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_cookie_attributes() {
        let app = TestApp::new();
        let response = app.post_form("/login", "username=ada", None).await;
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();

        assert!(set_cookie.starts_with("sid.local=s:"));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Path=/"));
        assert!(!set_cookie.contains("Secure"));
    }

    #[tokio::test]
    async fn test_login_without_username() {
        let app = TestApp::new();
        let response = app.post_form("/login", "username=", None).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(session_cookie(&response).is_none());
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let app = TestApp::new();
        let cookie = app.login("ada").await;

        let response = app.post_form("/logout", "", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/");
        assert!(
            response.headers()[header::SET_COOKIE]
                .to_str()
                .unwrap()
                .contains("Max-Age=0")
        );

        let response = app.get("/secure", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_session_data_persists() {
        let app = TestApp::new();
        let cookie = app.login("ada").await;

        let response = app.post_form("/secure/notes", "note=first", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        app.post_form("/secure/notes", "note=second", Some(&cookie)).await;

        let response = app.get("/secure/notes", Some(&cookie)).await;
        assert_eq!(
            json_body(response).await["notes"],
            serde_json::json!(["first", "second"])
        );
    }

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn load(&self, _id: &str) -> std::result::Result<Option<SessionRecord>, SessionError> {
            Err(SessionError::Poisoned)
        }

        async fn save(&self, _id: &str, _record: &SessionRecord) -> std::result::Result<(), SessionError> {
            Err(SessionError::Poisoned)
        }

        async fn destroy(&self, _id: &str) -> std::result::Result<(), SessionError> {
            Err(SessionError::Poisoned)
        }

        async fn purge_expired(&self) -> std::result::Result<usize, SessionError> {
            Err(SessionError::Poisoned)
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_forbids_secure_routes() {
        let app = TestApp::build(Environment::Development, Arc::new(BrokenStore), routes::ROUTES);
        let signer = CookieSigner::new(DEV_SESSION_SECRET).unwrap();
        let cookie = format!("{}={}", DEV_COOKIE_NAME, signer.sign("some-session"));

        let response = app.get("/secure", Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_error_probe_renders_status() {
        let app = TestApp::new();
        let response = app.get("/errors/503", None).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(text(response).await.contains("Error 503"));
    }

    #[tokio::test]
    async fn test_error_probe_rejects_non_status() {
        let app = TestApp::new();
        let response = app.get("/errors/teapot", None).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = text(response).await;
        assert!(body.contains("400 Bad Request"));
        assert!(body.contains("teapot"));
    }

    #[tokio::test]
    async fn test_malformed_body_renders_400_view() {
        let app = TestApp::new();
        let response = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{broken"))
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(text(response).await.contains("could not be accepted"));
    }

    #[tokio::test]
    async fn test_oversized_body_renders_413() {
        let app = TestApp::new();
        let form = format!("username={}", "a".repeat(BODY_LIMIT + 1));
        let response = app.post_form("/login", &form, None).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(text(response).await.contains("413 Payload Too Large"));
    }

    async fn explode() -> &'static str {
        panic!("handler exploded")
    }

    fn faulty_routes(router: routes::AppRouter, stages: &StageBundle) -> routes::AppRouter {
        let router = router
            .route("/panic", get(explode))
            .route("/missing-view", get(|| async { Reply::serve("nope", json!({})) }));
        stages.apply(router, &[routes::Stage::Helpers])
    }

    const FAULTY: &[RouteModule] = &[RouteModule {
        name: "faulty",
        mount: faulty_routes,
    }];

    #[tokio::test]
    async fn test_panic_renders_500() {
        let app = TestApp::build(Environment::Development, Arc::new(MemoryStore::new()), FAULTY);
        let response = app.get("/faulty/panic", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text(response).await.contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_production_hides_failure_detail() {
        let app = TestApp::build(Environment::Production, Arc::new(MemoryStore::new()), FAULTY);
        let response = app.get("/faulty/panic", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!text(response).await.contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_render_failure_becomes_500() {
        let app = TestApp::build(Environment::Development, Arc::new(MemoryStore::new()), FAULTY);
        let response = app.get("/faulty/missing-view", None).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text(response).await.contains("view &#39;nope&#39; not found"));
    }

    #[tokio::test]
    async fn test_small_responses_are_not_compressed() {
        let app = TestApp::new();
        let response = app
            .send(
                Request::builder()
                    .uri("/no/such/page")
                    .header(header::ACCEPT_ENCODING, "gzip")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert!(!response.headers().contains_key(header::CONTENT_ENCODING));
    }
}
