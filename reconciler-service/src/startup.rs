//! Application startup and lifecycle management.

use crate::bus::AmqpBus;
use crate::config::ReconcilerConfig;
use crate::reconcile::TaskOrchestrator;
use crate::services::{get_metrics, init_metrics, MongoStores, Stores};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<MongoStores>,
    bus: Arc<AmqpBus>,
}

/// Liveness: MongoDB must answer a ping.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "reconciler-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "reconciler-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness: MongoDB reachable and the AMQP connection open.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    if !state.bus.is_connected() {
        tracing::warn!("Readiness check failed - message bus disconnected");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container: HTTP probes plus the task consumer.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    db: Arc<MongoStores>,
    bus: Arc<AmqpBus>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl Application {
    pub async fn build(config: ReconcilerConfig) -> Result<Self, AppError> {
        init_metrics();

        let db = MongoStores::connect(&config.mongodb).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to MongoDB");
            e
        })?;
        db.initialize_indexes().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create indexes");
            e
        })?;
        let db = Arc::new(db);

        let bus = AmqpBus::connect(&config.rabbitmq).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to RabbitMQ");
            AppError::InternalError(anyhow::anyhow!("Failed to connect to RabbitMQ: {}", e))
        })?;
        let bus = Arc::new(bus);

        let orchestrator = Arc::new(TaskOrchestrator::new(
            Stores::from_backend(db.clone()),
            Arc::new(bus.publisher()),
            config.rabbitmq.outbound_queue.clone(),
        ));

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Reconciler service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            db,
            bus,
            orchestrator,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Serve probes and consume tasks until either side stops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            db: self.db.clone(),
            bus: self.bus.clone(),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(health_state);

        tracing::info!(
            service = "reconciler-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept tasks"
        );

        tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server error");
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            result = self.bus.consume(self.orchestrator.clone()) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Task consumer stopped");
                    return Err(std::io::Error::other(format!("Task consumer error: {}", e)));
                }
            }
        }

        Ok(())
    }
}
