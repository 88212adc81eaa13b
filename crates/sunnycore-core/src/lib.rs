//! sunnycore-core — ingestion, classification, embedding, and adaptive
//! sync for virtual-mail/Drive/Calendar content.
//!
//! This crate contains the core business logic described in the
//! specification: per-item ingestion (fetch → extract → classify →
//! chunk → embed), the adaptive multi-source synchronization engine
//! that drives it, and hybrid dense+sparse retrieval. It has no
//! daemon/CLI dependency — `sunnycored` wires this crate's pieces into
//! a running process.

pub mod chunker;
pub mod classify;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod providers;
pub mod push;
pub mod search;
pub mod store;
pub mod sync;

use std::collections::HashMap;
use std::sync::Arc;

pub use chunker::Chunker;
pub use classify::{ChatModel, Classifier};
pub use config::{Config, Settings};
pub use embeddings::Embedder;
pub use error::{CoreError, CoreResult};
pub use model::Source;
pub use pipeline::Pipeline;
pub use providers::ProviderAdapter;
pub use push::{JwtVerifier, PushHandler};
pub use search::VectorIndex;
pub use store::RecordStore;
pub use sync::scheduler::Scheduler;
pub use sync::watch_manager::WatchManager;

/// Explicit-dependency bundle every long-running component is
/// constructed from: the classifier client, embedder, vector index
/// client, and store client are wired once at process start and
/// passed down, rather than reached for as global singletons. A plain
/// struct shared behind `Arc`s, built once in `sunnycored::app::build`.
///
/// `M` is the single chat-completion model backing both the Classifier
/// (§4.5) and the Chunker's contextual-summary step (§4.4) — both sit
/// behind the same narrow `ChatModel` boundary, so one model instance
/// serves both call sites.
pub struct App<M: ChatModel> {
    pub config: Config,
    pub settings: Settings,
    pub store: Arc<dyn RecordStore>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub embedder: Arc<Embedder>,
    /// Shared chat-completion model; cloned into `classifier` via the
    /// blanket `ChatModel` impl on `Arc<M>` and borrowed directly by the
    /// Chunker's summary step at ingest time.
    pub model: Arc<M>,
    pub classifier: Classifier<Arc<M>>,
    pub adapters: Arc<HashMap<Source, Box<dyn ProviderAdapter>>>,
    pub scheduler: Arc<Scheduler>,
}

impl<M: ChatModel> App<M> {
    pub fn new(
        config: Config,
        settings: Settings,
        store: Arc<dyn RecordStore>,
        vector_index: Arc<dyn VectorIndex>,
        embedder: Arc<Embedder>,
        model: Arc<M>,
        adapters: HashMap<Source, Box<dyn ProviderAdapter>>,
    ) -> Self {
        let confidence_floor = settings.classification_confidence_floor;
        let classifier = Classifier::new(Arc::clone(&model), confidence_floor);
        Self {
            config,
            settings,
            store,
            vector_index,
            embedder,
            model,
            classifier,
            adapters: Arc::new(adapters),
            scheduler: Arc::new(Scheduler::new()),
        }
    }

    pub fn adapter_for(&self, source: Source) -> Option<&dyn ProviderAdapter> {
        self.adapters.get(&source).map(|b| b.as_ref())
    }

    /// Builds the Chunker for one ingest call (§4.4), borrowing the
    /// shared embedder/model/settings rather than owning them — matches
    /// `Pipeline`'s own borrow-everything shape (§5: no component holds
    /// a lock or owned resource across an `await` boundary it doesn't
    /// need to).
    pub fn chunker(&self) -> Chunker<'_, Embedder, Arc<M>> {
        Chunker::new(&*self.embedder, &self.model, &self.settings)
    }
}
