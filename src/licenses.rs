// SPDX-License-Identifier: AGPL-3.0-or-later

//! SPDX license registry
//!
//! Holds an immutable snapshot of the SPDX license list that is swapped
//! wholesale on refresh, and answers exact lookups and fuzzy suggestions
//! against whichever snapshot is current.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_LICENSE_URL: &str = "https://spdx.org/licenses/licenses.json";

/// One SPDX license as published in the license list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LicenseEntry {
    #[serde(rename = "licenseId")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "isDeprecatedLicenseId", default)]
    pub deprecated: bool,
    #[serde(rename = "isOsiApproved", default)]
    pub osi_approved: bool,
    #[serde(default)]
    pub reference: String,
}

impl LicenseEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            deprecated: false,
            osi_approved: false,
            reference: String::new(),
        }
    }
}

/// The SPDX `licenses.json` document
#[derive(Debug, Clone, Deserialize)]
pub struct LicenseList {
    #[serde(rename = "licenseListVersion", default)]
    pub version: Option<String>,
    pub licenses: Vec<LicenseEntry>,
}

impl LicenseList {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Failed to parse SPDX license list")
    }
}

/// An immutable view of the license list
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub version: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub licenses: Vec<LicenseEntry>,
}

impl Snapshot {
    /// Exact, case-sensitive identifier match
    pub fn lookup(&self, id: &str) -> Option<&LicenseEntry> {
        self.licenses.iter().find(|license| license.id == id)
    }

    /// Identifier most similar to `id`; ties go to the earliest entry
    pub fn suggest(&self, id: &str) -> Option<&str> {
        let needle = id.to_lowercase();
        let mut best: Option<(&LicenseEntry, f64)> = None;
        for license in &self.licenses {
            let score = strsim::jaro_winkler(&needle, &license.id.to_lowercase());
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((license, score));
            }
        }
        best.map(|(license, _)| license.id.as_str())
    }
}

/// Where license lists come from
#[async_trait]
pub trait LicenseSource: Send + Sync {
    async fn fetch(&self) -> Result<LicenseList>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;
}

/// Downloads the list from spdx.org (or a mirror)
pub struct SpdxSource {
    client: Client,
    url: String,
}

impl SpdxSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("lurebot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl LicenseSource for SpdxSource {
    async fn fetch(&self) -> Result<LicenseList> {
        debug!("Fetching SPDX license list from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to request SPDX license list")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to fetch SPDX license list: {} - {}", status, body);
        }

        let body = response
            .bytes()
            .await
            .context("Failed to read SPDX license list")?;
        LicenseList::from_json(&body)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Reads a local copy of `licenses.json`
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LicenseSource for FileSource {
    async fn fetch(&self) -> Result<LicenseList> {
        let data = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        LicenseList::from_json(&data)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Shared, periodically refreshed license snapshot
#[derive(Debug, Default)]
pub struct LicenseRegistry {
    current: Mutex<Arc<Snapshot>>,
}

impl LicenseRegistry {
    /// An empty registry; populate it with [`LicenseRegistry::refresh`]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(licenses: Vec<LicenseEntry>) -> Self {
        let registry = Self::new();
        registry.replace(Snapshot {
            version: None,
            fetched_at: Some(Utc::now()),
            licenses,
        });
        registry
    }

    fn lock(&self) -> MutexGuard<'_, Arc<Snapshot>> {
        // the guarded value is only ever swapped, so a poisoned lock still holds a valid snapshot
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn replace(&self, snapshot: Snapshot) {
        *self.lock() = Arc::new(snapshot);
    }

    /// The current snapshot; later refreshes do not affect it
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self.lock();
        Arc::clone(&*guard)
    }

    /// Fetch a new list and swap it in; on failure the previous snapshot stays
    pub async fn refresh(&self, source: &dyn LicenseSource) -> Result<()> {
        let list = source.fetch().await?;
        if list.licenses.is_empty() {
            anyhow::bail!("License list from {} is empty", source.describe());
        }

        let snapshot = Snapshot {
            version: list.version,
            fetched_at: Some(Utc::now()),
            licenses: list.licenses,
        };
        info!(
            "Loaded {} SPDX licenses (list version {}) from {}",
            snapshot.licenses.len(),
            snapshot.version.as_deref().unwrap_or("unknown"),
            source.describe()
        );
        self.replace(snapshot);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<LicenseEntry> {
        self.snapshot().lookup(id).cloned()
    }

    pub fn suggest(&self, id: &str) -> Option<String> {
        self.snapshot().suggest(id).map(str::to_string)
    }

    pub fn len(&self) -> usize {
        self.snapshot().licenses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> Option<String> {
        self.snapshot().version.clone()
    }
}

/// Refresh the registry every `every` until `shutdown` is cancelled
pub fn spawn_refresher(
    registry: Arc<LicenseRegistry>,
    source: Arc<dyn LicenseSource>,
    every: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("License refresher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = registry.refresh(source.as_ref()).await {
                        warn!("Error updating SPDX license list: {:#}", e);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry(ids: &[&str]) -> LicenseRegistry {
        LicenseRegistry::from_entries(ids.iter().map(|id| LicenseEntry::new(*id)).collect())
    }

    struct FailingSource;

    #[async_trait]
    impl LicenseSource for FailingSource {
        async fn fetch(&self) -> Result<LicenseList> {
            anyhow::bail!("network unreachable")
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        let registry = registry(&["MIT", "Apache-2.0"]);
        assert!(registry.lookup("MIT").is_some());
        assert!(registry.lookup("mit").is_none());
    }

    #[test]
    fn test_suggest_prefers_closest() {
        let registry = registry(&["MIT", "MIT-0", "GPL-3.0-only"]);
        assert_eq!(registry.suggest("MIT0").as_deref(), Some("MIT-0"));
        assert_eq!(registry.suggest("gpl-3.0-only").as_deref(), Some("GPL-3.0-only"));
    }

    #[test]
    fn test_suggest_tie_goes_to_first_entry() {
        let registry = registry(&["ABC", "ABC"]);
        let snapshot = registry.snapshot();
        let suggested = snapshot.suggest("abc").unwrap();
        assert!(std::ptr::eq(suggested, snapshot.licenses[0].id.as_str()));
    }

    #[test]
    fn test_suggest_on_empty_registry() {
        assert_eq!(LicenseRegistry::new().suggest("MIT"), None);
    }

    #[test]
    fn test_parse_spdx_document() {
        let json = br#"{
            "licenseListVersion": "3.24",
            "licenses": [
                {"licenseId": "MIT", "name": "MIT License", "isDeprecatedLicenseId": false,
                 "isOsiApproved": true, "reference": "https://spdx.org/licenses/MIT.html",
                 "detailsUrl": "ignored"}
            ]
        }"#;
        let list = LicenseList::from_json(json).unwrap();
        assert_eq!(list.version.as_deref(), Some("3.24"));
        assert_eq!(list.licenses[0].id, "MIT");
        assert!(list.licenses[0].osi_approved);
    }

    #[tokio::test]
    async fn test_refresh_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"licenseListVersion": "3.24", "licenses": [{{"licenseId": "0BSD"}}]}}"#
        )
        .unwrap();

        let registry = LicenseRegistry::new();
        registry.refresh(&FileSource::new(file.path())).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.version().as_deref(), Some("3.24"));
        assert!(registry.snapshot().fetched_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let registry = registry(&["MIT"]);
        assert!(registry.refresh(&FailingSource).await.is_err());
        assert!(registry.lookup("MIT").is_some());
    }

    #[tokio::test]
    async fn test_empty_list_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"licenses": []}}"#).unwrap();

        let registry = registry(&["MIT"]);
        assert!(registry.refresh(&FileSource::new(file.path())).await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_stable_across_swaps() {
        let registry = registry(&["MIT"]);
        let before = registry.snapshot();
        registry.replace(Snapshot::default());
        assert_eq!(before.licenses.len(), 1);
        assert!(registry.is_empty());
    }
}
