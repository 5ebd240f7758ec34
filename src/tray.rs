//! Runtime cassette state
//!
//! The tray holds the inserted cassette, its episodes and the policy toggles.
//! Requests read an immutable [`Snapshot`]; every change builds a new snapshot
//! and swaps it in while holding the writer lock, so control updates, resets,
//! appends and cassette saves never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cassette::{validate_cassette_name, CassetteStore, Episode, RecordedRequest, Target};
use crate::matcher;
use crate::{BetamaxError, Result};

/// Policy toggles and the inserted cassette name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Inserted cassette, empty when the tray is empty
    pub cassette: String,
    /// Record requests that have no episode yet
    pub record_new_episodes: bool,
    /// Answer unmatched requests with 499 instead of forwarding them
    pub deny_unrecorded_requests: bool,
    /// Send the upstream's host in the Host header
    pub rewrite_host_header: bool,
    /// Header names that take part in matching
    pub match_headers: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cassette: String::new(),
            record_new_episodes: true,
            deny_unrecorded_requests: false,
            rewrite_host_header: true,
            match_headers: Vec::new(),
        }
    }
}

/// Partial settings sent by a client; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    /// New cassette name
    pub cassette: Option<String>,
    /// New recording toggle
    pub record_new_episodes: Option<bool>,
    /// New denial toggle
    pub deny_unrecorded_requests: Option<bool>,
    /// New host rewrite toggle
    pub rewrite_host_header: Option<bool>,
    /// New matched header list
    pub match_headers: Option<Vec<String>>,
}

impl SettingsUpdate {
    /// Settings after applying this update to `current`
    ///
    /// Ejecting the cassette (empty name) puts the toggles back to their
    /// defaults.
    #[must_use]
    pub fn apply(&self, current: &Settings) -> Settings {
        let mut next = current.clone();

        if let Some(cassette) = &self.cassette {
            next.cassette.clone_from(cassette);
        }
        if let Some(record) = self.record_new_episodes {
            next.record_new_episodes = record;
        }
        if let Some(deny) = self.deny_unrecorded_requests {
            next.deny_unrecorded_requests = deny;
        }
        if let Some(rewrite) = self.rewrite_host_header {
            next.rewrite_host_header = rewrite;
        }
        if let Some(headers) = &self.match_headers {
            next.match_headers.clone_from(headers);
        }

        if next.cassette.is_empty() {
            let defaults = Settings::default();
            next.record_new_episodes = defaults.record_new_episodes;
            next.deny_unrecorded_requests = defaults.deny_unrecorded_requests;
            next.rewrite_host_header = defaults.rewrite_host_header;
        }

        next
    }
}

/// Settings as reported by the control endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsView {
    /// Current settings
    #[serde(flatten)]
    pub settings: Settings,
    /// Episodes held by the inserted cassette
    pub episode_count: usize,
}

/// Immutable view of the tray handed to one request
#[derive(Debug, Default)]
pub struct Snapshot {
    settings: Settings,
    episodes: Vec<Episode>,
    // method -> target -> positions in `episodes`, ascending
    index: HashMap<String, HashMap<Target, Vec<usize>>>,
}

impl Snapshot {
    fn new(settings: Settings, episodes: Vec<Episode>) -> Self {
        let mut snapshot = Self {
            settings,
            episodes: Vec::with_capacity(episodes.len()),
            index: HashMap::new(),
        };
        for episode in episodes {
            snapshot.push(episode);
        }
        snapshot
    }

    fn push(&mut self, episode: Episode) {
        let position = self.episodes.len();
        self.index
            .entry(episode.request.method.clone())
            .or_default()
            .entry(episode.request.target.clone())
            .or_default()
            .push(position);
        self.episodes.push(episode);
    }

    /// Current settings
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Episodes in recording order
    #[must_use]
    pub fn episodes(&self) -> &[Episode] {
        &self.episodes
    }

    /// First recorded episode matching `live`
    ///
    /// Only episodes with the same method and target are compared in full.
    #[must_use]
    pub fn find(&self, live: &RecordedRequest) -> Option<&Episode> {
        let positions = self.index.get(&live.method)?.get(&live.target)?;
        matcher::find_episode(
            positions.iter().map(|&i| &self.episodes[i]),
            live,
            &self.settings.match_headers,
        )
    }

    /// Control endpoint view
    #[must_use]
    pub fn view(&self) -> SettingsView {
        SettingsView {
            settings: self.settings.clone(),
            episode_count: self.episodes.len(),
        }
    }
}

/// Shared cassette state
pub struct Tray {
    store: CassetteStore,
    target_host: String,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl Tray {
    /// Empty tray with default settings
    #[must_use]
    pub fn new(store: CassetteStore, target_host: impl Into<String>) -> Self {
        Self {
            store,
            target_host: target_host.into(),
            current: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
        }
    }

    /// Upstream host used for Host header rewriting
    #[must_use]
    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Current settings and episode count
    pub async fn view(&self) -> SettingsView {
        self.snapshot().await.view()
    }

    async fn install(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().await = Arc::clone(&snapshot);
        snapshot
    }

    /// Apply a settings update and load the resulting cassette
    ///
    /// If the cassette file cannot be read the new settings still take
    /// effect with no episodes, and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the cassette name is invalid (nothing changes) or
    /// if the cassette file cannot be read or decoded
    pub async fn update(&self, update: &SettingsUpdate) -> Result<SettingsView> {
        let _writer = self.writer.lock().await;

        let settings = update.apply(self.snapshot().await.settings());
        if !settings.cassette.is_empty() {
            validate_cassette_name(&settings.cassette)?;
        }

        match self.store.load(&settings.cassette).await {
            Ok(episodes) => {
                if settings.cassette.is_empty() {
                    info!("No cassette in the tray");
                } else {
                    info!(
                        "Cassette '{}' loaded: {} episodes, recording: {}, denying: {}",
                        settings.cassette,
                        episodes.len(),
                        settings.record_new_episodes,
                        settings.deny_unrecorded_requests
                    );
                }
                Ok(self.install(Snapshot::new(settings, episodes)).await.view())
            }
            Err(e) => {
                warn!("Cassette '{}' failed to load: {}", settings.cassette, e);
                self.install(Snapshot::new(settings, Vec::new())).await;
                Err(e)
            }
        }
    }

    /// Forget every episode of the inserted cassette and delete its file
    ///
    /// # Errors
    ///
    /// Returns [`BetamaxError::NoCassette`] if the tray is empty, or an I/O
    /// error if the file cannot be removed
    pub async fn reset(&self) -> Result<SettingsView> {
        let _writer = self.writer.lock().await;

        let settings = self.snapshot().await.settings().clone();
        if settings.cassette.is_empty() {
            return Err(BetamaxError::NoCassette);
        }

        let cassette = settings.cassette.clone();
        let snapshot = self.install(Snapshot::new(settings, Vec::new())).await;
        self.store.erase(&cassette).await?;

        Ok(snapshot.view())
    }

    /// Append a freshly recorded episode and rewrite the cassette file
    ///
    /// `cassette` is the cassette that was inserted when the request was
    /// decided; if another one has been inserted since, the episode is
    /// dropped. The episode stays in memory even when the save fails.
    ///
    /// # Errors
    ///
    /// Returns error if the cassette file cannot be written
    pub async fn record(&self, cassette: &str, episode: Episode) -> Result<()> {
        let _writer = self.writer.lock().await;

        let current = self.snapshot().await;
        if current.settings.cassette != cassette {
            warn!(
                "Cassette changed from '{}' to '{}' while recording, dropping episode",
                cassette, current.settings.cassette
            );
            return Ok(());
        }

        let mut next = Snapshot::new(current.settings.clone(), current.episodes.clone());
        next.push(episode);
        let next = self.install(next).await;

        debug!(
            "Cassette '{}' now holds {} episodes",
            cassette,
            next.episodes.len()
        );
        self.store.save(cassette, &next.episodes).await
    }
}
