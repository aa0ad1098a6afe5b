mod api;

use std::{env, net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use rulemend_core::diagnosis::DiagnosisOrchestrator;
use rulemend_core::llm::{GenaiLLMClient, LLMClient};
use rulemend_core::{Config, Database, init_telemetry, migrations};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    db: Database,
    orchestrator: DiagnosisOrchestrator,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let llm = GenaiLLMClient::new(db.clone(), &config.model);
    info!(model = llm.model(), "reasoning service configured");
    let llm: Arc<dyn LLMClient> = Arc::new(llm);
    let orchestrator = DiagnosisOrchestrator::new(db.clone(), llm, config.diagnosis.clone())
        .with_sampling(config.model.temperature, config.model.max_output_tokens);

    let shutdown = CancellationToken::new();
    let state = AppState { db, orchestrator };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("{} listening on {}", config.app.service_name, listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    Ok(())
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api::router())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = match state.db.health_check().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "database health check failed");
            false
        }
    };

    let (status, label, database) = if healthy {
        (StatusCode::OK, "healthy", "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", "unhealthy")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: database.to_string(),
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulemend_core::DiagnosisConfig;
    use rulemend_core::llm::MockLLMClient;

    #[tokio::test]
    async fn healthz_reports_ok_when_database_is_reachable() {
        let db = Database::new(std::path::Path::new(":memory:"))
            .await
            .expect("db");
        let orchestrator = DiagnosisOrchestrator::new(
            db.clone(),
            Arc::new(MockLLMClient::new()),
            DiagnosisConfig::default(),
        );
        let state = AppState { db, orchestrator };
        let (status, Json(body)) = healthz(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "healthy");
        assert_eq!(body.database, "ok");
    }
}
