//! Stored session shared by every command.

use anyhow::{Context, Result};
use tracing::info;

use thinktank::config::ThinktankConfig;
use thinktank::storage::{JsonFileStore, PersistTier, StoredState, load_state, persist_with_fallback};

pub struct Session {
    pub store: JsonFileStore,
    pub state: StoredState,
    fallback_runs: usize,
}

impl Session {
    /// Load `state.json` from the data directory, normalised against the
    /// configured defaults.
    pub fn open(config: &ThinktankConfig) -> Result<Self> {
        let mut store = JsonFileStore::in_dir(&config.data_dir);
        if let Some(capacity) = config.toml.history.capacity_bytes {
            store = store.with_capacity(capacity);
        }
        let state = load_state(&store, &config.models(), &config.catalog())
            .with_context(|| format!("Failed to load {}", store.path().display()))?;
        Ok(Self {
            store,
            state,
            fallback_runs: config.fallback_runs(),
        })
    }

    pub fn save(&self) -> Result<PersistTier> {
        let tier = persist_with_fallback(&self.store, &self.state, self.fallback_runs)
            .with_context(|| format!("Failed to save {}", self.store.path().display()))?;
        if tier != PersistTier::Full {
            info!(?tier, "Session saved with reduced history");
        }
        Ok(tier)
    }
}
