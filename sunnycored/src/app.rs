//! Builds the `App` bundle every subcommand operates on: connects the
//! Record Store, opens the Vector Index, loads the Embedder, wires the
//! Classifier's chat model, and constructs a `ProviderAdapter` per
//! source from environment configuration.
//!
//! Fixed deployment config is built eagerly; the heavyweight embedding
//! model load is kept a separate async step since it's the slowest part
//! of startup.

use std::collections::HashMap;
use std::sync::Arc;

use sunnycore_core::classify::OpenAiChatModel;
use sunnycore_core::providers::fixture::FixtureAdapter;
use sunnycore_core::providers::http::{HttpProviderAdapter, HttpProviderConfig};
use sunnycore_core::providers::ProviderAdapter;
use sunnycore_core::store::{PgStore, RecordStore};
use sunnycore_core::{App, Config, Embedder, Settings, Source};

use crate::error::CliError;

/// The concrete chat model this binary runs with. The Classifier and
/// the Chunker's summariser share this one instance through `App`'s
/// `Arc<M>` (§4.5, §4.4).
pub type DaemonApp = App<OpenAiChatModel>;

/// Builds one `HttpProviderAdapter` per source with a configured
/// `SUNNYCORE_<SOURCE>_BASE_URL`/`SUNNYCORE_<SOURCE>_TOKEN` pair, and a
/// `FixtureAdapter` for any source left unconfigured — the shape
/// self-hosted/test deployments use per `fixture.rs`'s own doc comment.
fn build_adapters() -> HashMap<Source, Box<dyn ProviderAdapter>> {
    let sources = [
        (Source::Mail, "MAIL"),
        (Source::Drive, "DRIVE"),
        (Source::Calendar, "CALENDAR"),
    ];

    let mut adapters: HashMap<Source, Box<dyn ProviderAdapter>> = HashMap::new();
    for (source, prefix) in sources {
        let base_url = std::env::var(format!("SUNNYCORE_{prefix}_BASE_URL"));
        let token = std::env::var(format!("SUNNYCORE_{prefix}_TOKEN"));

        let adapter: Box<dyn ProviderAdapter> = match (base_url, token) {
            (Ok(base_url), Ok(bearer_token)) => Box::new(HttpProviderAdapter::new(
                source,
                HttpProviderConfig {
                    base_url,
                    bearer_token,
                },
            )),
            _ => {
                tracing::warn!(
                    source = %source,
                    "no endpoint configured, falling back to the in-memory fixture adapter"
                );
                Box::new(FixtureAdapter::new(source))
            }
        };
        adapters.insert(source, adapter);
    }

    adapters
}

/// Connects/loads every long-lived dependency and returns the bundle
/// every admin command and the `serve` loop are built from.
pub async fn build(config: &Config, settings: Settings) -> Result<DaemonApp, CliError> {
    config
        .ensure_dirs()
        .map_err(|e| CliError::Internal(anyhow::anyhow!("failed to create data directories: {e}")))?;

    let store = PgStore::connect(&config.database_url)
        .await
        .map_err(|e| CliError::Internal(anyhow::anyhow!("failed to connect to store: {e}")))?;
    store
        .run_migrations()
        .await
        .map_err(|e| CliError::Internal(anyhow::anyhow!("failed to run migrations: {e}")))?;
    let store: Arc<dyn RecordStore> = Arc::new(store);

    let embedding_repo =
        std::env::var("SUNNYCORE_EMBEDDING_MODEL").unwrap_or_else(|_| "intfloat/e5-base-v2".to_string());
    let embedding_dimensions: usize = std::env::var("SUNNYCORE_EMBEDDING_DIMENSIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(768);

    let vector_index = sunnycore_core::search::MilliVectorIndex::open(
        &config.vector_index_dir,
        embedding_dimensions,
    )
    .map_err(|e| CliError::Internal(anyhow::anyhow!("failed to open vector index: {e}")))?;
    let vector_index = Arc::new(vector_index);

    let embedder = Embedder::new(&embedding_repo, embedding_dimensions)
        .await
        .map_err(|e| CliError::Internal(anyhow::anyhow!("failed to load embedding model: {e}")))?;
    let embedder = Arc::new(embedder);

    let openai_api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| CliError::Internal(anyhow::anyhow!("OPENAI_API_KEY is not set")))?;
    let chat_model_name =
        std::env::var("SUNNYCORE_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let model = Arc::new(OpenAiChatModel::new(&openai_api_key, &chat_model_name));

    let adapters = build_adapters();

    Ok(App::new(
        config.clone(),
        settings,
        store,
        vector_index,
        embedder,
        model,
        adapters,
    ))
}
