//! Process configuration, split into `Config` (fixed at deployment time,
//! loaded via `load_or_default`/`ensure_dirs`) and `Settings` (tunable
//! without a redeploy, layered defaults→file→env via the `config` crate).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Deployment-fixed values: connection strings, bind addresses, worker
/// pool sizes, the mail domain used for virtual-address recognition.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub settings_file: PathBuf,
    /// Postgres connection string for the Record Store.
    pub database_url: String,
    /// On-disk path for the milli-backed Vector Index.
    pub vector_index_dir: PathBuf,
    /// Domain used to recognise `ai+<username>@<domain>` addresses (§6).
    pub mail_domain: String,
    /// Worker pool size bounding total concurrent outbound-provider calls.
    pub pipeline_worker_pool_size: usize,
    /// Per-user concurrent Ingest cap for the Poller (§4.9, default 4).
    pub poller_concurrency_per_user: usize,
}

impl Config {
    pub fn load_or_default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sunnycore");

        Self {
            settings_file: data_dir.join("settings.json"),
            vector_index_dir: data_dir.join("vectors"),
            database_url: std::env::var("SUNNYCORE_DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/sunnycore".to_string()),
            mail_domain: std::env::var("SUNNYCORE_MAIL_DOMAIN")
                .unwrap_or_else(|_| "sunnycore.example".to_string()),
            pipeline_worker_pool_size: 16,
            poller_concurrency_per_user: 4,
            data_dir,
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.vector_index_dir)?;
        Ok(())
    }
}

/// Tunable values an operator may change without a redeploy: scheduler
/// intervals, hybrid-search weights, the classification confidence
/// floor. Persisted as JSON, loaded through the `config` crate so a file
/// on disk and environment variables (`SUNNYCORE_SETTINGS__*`) both
/// override the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Confidence threshold below which the Classifier returns
    /// Unclassified (§4.5; 0.5 per spec.md, an explicit Open Question
    /// resolved in DESIGN.md).
    pub classification_confidence_floor: f32,
    /// Sentence-similarity drop threshold for the contextual chunker
    /// (§4.4, default τ=0.6).
    pub chunk_similarity_threshold: f32,
    /// Chunk token floor/ceiling for the contextual chunker (§4.4).
    pub chunk_token_floor: u32,
    pub chunk_token_ceiling: u32,
    /// Minimum chunk quality score; chunks below this are dropped (§4.4).
    pub chunk_quality_floor: f32,
    /// Hybrid search weights (§4.12, must sum to 1.0).
    pub dense_weight: f32,
    pub sparse_weight: f32,
    /// BM25 parameters (§4.12).
    pub bm25_k1: f32,
    pub bm25_b: f32,
    /// Watch renewal scan cadence in hours (§4.11, default 6h) and the
    /// renewal lookahead window in hours (default 25h).
    pub watch_scan_interval_hours: i64,
    pub watch_renewal_lookahead_hours: i64,
    /// Days of inactivity before a user's polling is suspended (§4.10).
    pub inactivity_suspend_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            classification_confidence_floor: 0.5,
            chunk_similarity_threshold: 0.6,
            chunk_token_floor: 100,
            chunk_token_ceiling: 400,
            chunk_quality_floor: 0.3,
            dense_weight: 0.7,
            sparse_weight: 0.3,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            watch_scan_interval_hours: 6,
            watch_renewal_lookahead_hours: 25,
            inactivity_suspend_days: 14,
        }
    }
}

impl Settings {
    /// Load from `path` layered over defaults, then over
    /// `SUNNYCORE_SETTINGS__*` environment overrides. Falls back to pure
    /// defaults if the file doesn't exist yet.
    pub fn load(path: &std::path::Path) -> Self {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default()).unwrap_or_default());

        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SUNNYCORE_SETTINGS").separator("__"),
        );

        match builder.build().and_then(|c| c.try_deserialize()) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load settings, using defaults");
                Settings::default()
            }
        }
    }

    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let s = Settings::default();
        assert_eq!(s.classification_confidence_floor, 0.5);
        assert_eq!(s.chunk_similarity_threshold, 0.6);
        assert_eq!(s.bm25_k1, 1.2);
        assert_eq!(s.bm25_b, 0.75);
        assert!((s.dense_weight + s.sparse_weight - 1.0).abs() < 1e-6);
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let loaded = Settings::load(&path);
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.classification_confidence_floor = 0.65;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded.classification_confidence_floor, 0.65);
    }
}
