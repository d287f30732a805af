//! Friday - conversational assistant server
//!
//! Serves tool-augmented chat completions over HTTP. The model can save,
//! search, list and forget notes in a persistent memory store.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod providers;
mod routes;
mod tools;

use crate::config::{persona, Config};
use crate::core::{ChatEngine, Journal, MemoryPaths, MemoryStore};
use crate::providers::OpenAICompatProvider;
use crate::tools::ToolRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub chat_engine: Arc<ChatEngine>,
    pub tools: Arc<ToolRegistry>,
    pub memory: Arc<MemoryStore>,
    /// Absent when journaling is switched off
    pub journal: Option<Arc<Journal>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "friday=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let memory = Arc::new(MemoryStore::open(&MemoryPaths::under(&config.data_dir)).await?);
    tracing::info!(
        backend = %memory.backend_kind(),
        data_dir = %config.data_dir.display(),
        "memory store ready"
    );

    let tools = Arc::new(ToolRegistry::new(memory.clone()));

    if config.api_key.is_none() {
        tracing::warn!(env = %config.llm.api_key_env, "no API key set");
    }
    let model = Arc::new(OpenAICompatProvider::new(config.provider_config())?);

    let system_prompt = persona::resolve_system_prompt(&config.persona).await;
    let chat_engine =
        Arc::new(ChatEngine::new(model, tools.clone()).with_system_prompt(system_prompt));

    tracing::info!(model = %chat_engine.model_name(), "chat engine ready");

    let journal = config.journal_enabled.then(|| {
        Arc::new(Journal::new(
            config.data_dir.join("journal"),
            config.persona.name.clone(),
        ))
    });
    if let Some(journal) = &journal {
        tracing::info!(dir = %journal.dir().display(), "journaling exchanges");
    }

    let state = AppState {
        config,
        chat_engine,
        tools,
        memory,
        journal,
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Friday listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
