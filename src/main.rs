use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod backend;
mod config;
mod engine;
mod error;
mod session_actor;
mod state;
mod web;

use crate::backend::build_backend;
use crate::config::load_settings;
use crate::engine::{IdentityGate, LockRegistry};
use crate::error::{ConfigError, Result as AppResult};
use crate::session_actor::SessionServices;
use crate::state::AppState;
use crate::web::run_server;

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=debug", env!("CARGO_PKG_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app_settings = load_settings()?;
    tracing::info!(
        server.port = app_settings.server.port,
        backend.source_type = ?app_settings.backend.source_type,
        quiz.student_id_pattern = %app_settings.quiz.student_id_pattern,
        "Configuration loaded"
    );

    let backend = build_backend(&app_settings.backend).await?;
    tracing::info!("Quiz backend initialized");

    let gate = IdentityGate::new(
        &app_settings.quiz.student_id_pattern,
        app_settings.quiz.student_id_hint.clone(),
    )
    .map_err(|e| ConfigError::InvalidValue(format!("quiz.student_id_pattern: {e}")))?;

    let app_state = AppState {
        services: SessionServices {
            backend,
            gate: Arc::new(gate),
            locks: Arc::new(LockRegistry::new()),
        },
    };

    run_server(app_state, app_settings.server).await?;

    Ok(())
}
