use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware,
    routing::{get, post, put},
};
use tokio::{
    net::TcpListener,
    signal::{
        self,
        unix::{SignalKind, signal},
    },
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::catalog;
use crate::config::Config;
use crate::diet;
use crate::downloader;
use crate::error::AppError;
use crate::graph;
use crate::login;
use crate::nutrition::{self, NutritionAnalyzer, RemoteAnalyzer};
use crate::quiz;
use crate::store::Store;
use crate::water;

/// Base64 meal images exceed the axum default body limit.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub http: reqwest::Client,
    pub analyzer: Option<Arc<dyn NutritionAnalyzer>>,
}

impl AppState {
    /// Opens the data directory and builds the remote analyzer when
    /// `NUTRITION_API_URL` is set.
    pub fn new(config: Config) -> Result<Arc<Self>, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(AppError::internal)?;

        let analyzer: Option<Arc<dyn NutritionAnalyzer>> = match &config.nutrition_api_url {
            Some(url) => {
                info!("Using nutrition analyzer at {url}");
                Some(Arc::new(RemoteAnalyzer::new(
                    http.clone(),
                    url.clone(),
                    config.nutrition_api_key.clone(),
                )))
            }
            None => {
                warn!("NUTRITION_API_URL not set, image analysis will use estimates");
                None
            }
        };

        Self::with_analyzer(config, http, analyzer)
    }

    pub fn with_analyzer(
        config: Config,
        http: reqwest::Client,
        analyzer: Option<Arc<dyn NutritionAnalyzer>>,
    ) -> Result<Arc<Self>, AppError> {
        let store = Store::open(&config.data_dir)?;

        Ok(Arc::new(Self {
            config,
            store,
            http,
            analyzer,
        }))
    }
}

/// Builds the full HTTP API.
///
/// Everything except registration, login and password recovery sits behind
/// [`login::require_auth`].
pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/health", get(|| async { "ok" }))
        .route("/api/auth/register", post(login::handle_register))
        .route("/api/auth/login", post(login::handle_login))
        .route("/api/auth/logout", post(login::handle_logout))
        .route("/api/auth/forgot-password", post(login::handle_forgot_password))
        .route("/api/auth/reset-password", post(login::handle_reset_password));

    let protected = Router::new()
        // accounts
        .route("/api/auth/me", get(login::handle_me))
        .route("/api/auth/change-password", post(login::handle_change_password))
        .route("/api/users/:username/features", put(login::handle_set_features))
        // diet
        .route("/api/diet", get(diet::handle_list).post(diet::handle_create))
        .route("/api/diet/analytics", get(diet::handle_analytics))
        .route("/api/diet/analytics/chart", get(graph::handle_diet_chart))
        .route("/api/diet/export", get(downloader::handle_export))
        .route(
            "/api/diet/archive",
            get(downloader::handle_archive_download).post(downloader::handle_archive_upload),
        )
        .route("/api/diet/admin/:user_id", get(diet::handle_admin_list))
        .route(
            "/api/diet/:id",
            get(diet::handle_get)
                .put(diet::handle_update)
                .delete(diet::handle_delete),
        )
        // nutrition
        .route("/api/nutrition/estimate", post(nutrition::handle_estimate))
        .route("/api/nutrition/analyze", post(nutrition::handle_analyze))
        // water
        .route("/api/water-tracking/today", get(water::handle_today))
        .route("/api/water-tracking/history", get(water::handle_history))
        .route("/api/water-tracking/analytics", get(water::handle_analytics))
        .route("/api/water-tracking/chart", get(graph::handle_water_chart))
        .route("/api/water-tracking/add", post(water::handle_add))
        .route("/api/water-tracking/remove", post(water::handle_remove))
        .route("/api/water-tracking/reset", post(water::handle_reset))
        .route(
            "/api/water-tracking/goal",
            put(water::handle_goal).post(water::handle_goal),
        )
        // catalog
        .route(
            "/api/collections",
            get(catalog::handle_list_collections).post(catalog::handle_create_collection),
        )
        .route(
            "/api/collections/:id",
            get(catalog::handle_get_collection)
                .put(catalog::handle_update_collection)
                .delete(catalog::handle_delete_collection),
        )
        .route("/api/collections/:id/access", post(catalog::handle_grant_access))
        .route(
            "/api/products",
            get(catalog::handle_list_products).post(catalog::handle_create_product),
        )
        .route(
            "/api/products/:id",
            get(catalog::handle_get_product)
                .put(catalog::handle_update_product)
                .delete(catalog::handle_delete_product),
        )
        // quizzes
        .route(
            "/api/quizzes",
            get(quiz::handle_list_quizzes).post(quiz::handle_create_quiz),
        )
        .route("/api/quizzes/next", get(quiz::handle_next_quiz))
        .route("/api/quizzes/:id/assign", post(quiz::handle_assign_quiz))
        .route("/api/quizzes/:id/complete", post(quiz::handle_complete_quiz))
        .route_layer(middleware::from_fn(login::require_auth));

    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    public
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading configuration...");
    let config = Config::load();
    let address = format!("{}:{}", config.bind_addr, config.port);

    info!("Initializing state...");
    let state = AppState::new(config)?;
    let app = router(state);

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on http://{address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
