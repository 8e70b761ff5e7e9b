use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use kiln_core::{
    CandleEngine, Error, GenerationRequest, GenerationScheduler, ModelDescriptor, ModelManager,
    ModelRegistry, ModelStore, ResidentModel, ResourceBudget,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln image generation server")]
struct Args {
    /// Directory holding model pipelines and checkpoints
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Device memory budget for resident models, in GiB
    #[arg(long, default_value_t = 16)]
    budget_gb: u64,

    /// How many models may be resident at once
    #[arg(long, default_value_t = 1)]
    slots: usize,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
    seed: u64,
    elapsed_ms: u64,
}

#[derive(Serialize)]
struct ModelStatus {
    #[serde(flatten)]
    descriptor: ModelDescriptor,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    loaded_memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ref_count: Option<u32>,
}

#[derive(Serialize)]
struct RefreshResponse {
    added: usize,
    total: usize,
}

// Application state shared by every handler.
struct AppState {
    scheduler: Arc<GenerationScheduler>,
    manager: Arc<ModelManager>,
    registry: Arc<ModelRegistry>,
    store: Arc<ModelStore>,
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Response {
    match state.scheduler.submit(request).await {
        Ok(result) => Json(GenerationResponse {
            image: BASE64_STANDARD.encode(&result.image_png),
            seed: result.seed,
            elapsed_ms: result.elapsed_ms,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_models_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ModelStatus>> {
    let residents: HashMap<String, ResidentModel> = state
        .manager
        .residents()
        .into_iter()
        .map(|model| (model.id.clone(), model))
        .collect();
    let models = state
        .registry
        .list()
        .map(|descriptor| {
            let resident = residents.get(&descriptor.id);
            ModelStatus {
                state: resident.map_or_else(|| "unloaded".to_string(), |m| m.state.to_string()),
                loaded_memory_bytes: resident.map(|m| m.loaded_memory_bytes),
                ref_count: resident.map(|m| m.ref_count),
                descriptor,
            }
        })
        .collect();
    Json(models)
}

async fn load_model_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.reload(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn refresh_models_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store.clone();
    let catalog = match tokio::task::spawn_blocking(move || store.catalog()).await {
        Ok(Ok(catalog)) => catalog,
        Ok(Err(err)) => return error_response(err),
        Err(err) => return error_response(Error::Store(format!("scan task failed: {err}"))),
    };
    let added = register_catalog(&state.registry, catalog);
    Json(RefreshResponse {
        added,
        total: state.registry.len(),
    })
    .into_response()
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::DuplicateId(_) => StatusCode::CONFLICT,
        Error::InsufficientCapacity { .. } | Error::OutOfMemory(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::LoadFailure { .. } | Error::EngineFailure(_) | Error::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, "request rejected");
    }
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn register_catalog(registry: &ModelRegistry, catalog: Vec<ModelDescriptor>) -> usize {
    let mut added = 0;
    for descriptor in catalog {
        let id = descriptor.id.clone();
        match registry.register(descriptor) {
            Ok(true) => added += 1,
            Ok(false) => {}
            Err(err) => warn!(id = %id, error = %err, "skipping conflicting model"),
        }
    }
    added
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => {
            error!(error = %err, "cannot listen for shutdown signals");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = Arc::new(ModelStore::new(&args.models_dir));
    let registry = Arc::new(ModelRegistry::new());
    let added = register_catalog(&registry, store.catalog()?);
    info!(added, models_dir = %args.models_dir.display(), "models registered");

    let engine = Arc::new(CandleEngine::new(args.cpu)?);
    let budget = ResourceBudget::new(args.budget_gb.saturating_mul(1 << 30), args.slots);
    let manager = Arc::new(ModelManager::new(engine, registry.clone(), budget));
    let scheduler = Arc::new(GenerationScheduler::new(manager.clone(), registry.clone()));

    let state = Arc::new(AppState {
        scheduler,
        manager: manager.clone(),
        registry,
        store,
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generate_handler))
        .route("/v1/models", get(list_models_handler))
        .route("/v1/models/refresh", post(refresh_models_handler))
        .route("/v1/models/{id}/load", post(load_model_handler))
        .with_state(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, draining resident models");
    if let Err(err) = manager.evict_all().await {
        error!(error = %err, "model teardown failed");
        std::process::exit(1);
    }
    Ok(())
}
