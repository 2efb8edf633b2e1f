// Token store: in-memory scope map mirrored to a JSON file

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::types::{Scope, StoredEntry, TokenRecord, SITE_ROOT_KEY};
use crate::error::BrokerError;

/// Process-wide credential map, loaded once at startup and persisted wholesale
/// after every mutation.
pub struct TokenStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl TokenStore {
    /// Read the persisted mapping. A missing or unparsable file is fatal.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let path = path.into();
        tracing::info!("Loading token store from {}", path.display());

        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            BrokerError::StorageUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let entries = parse_entries(&raw)
            .map_err(|e| BrokerError::StorageUnavailable(format!("{}: {:#}", path.display(), e)))?;

        tracing::info!("Token store loaded with {} entries", entries.len());
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Write an empty mapping when no store exists yet
    pub async fn init_if_missing(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        tracing::info!("Creating empty token store at {}", path.display());
        write_atomic(path, "{}").await
    }

    /// Store backed by `path` with the given entries, without reading the file
    pub fn with_entries(path: impl Into<PathBuf>, entries: HashMap<String, StoredEntry>) -> Self {
        Self {
            path: path.into(),
            entries: RwLock::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Token record stored for `scope`, if any (expired or not)
    pub async fn get(&self, scope: &Scope) -> Option<TokenRecord> {
        let entries = self.entries.read().await;
        match entries.get(scope.key().as_ref()) {
            Some(StoredEntry::Token(record)) => Some(record.clone()),
            _ => None,
        }
    }

    /// Replace the record for `scope` and persist the whole mapping
    pub async fn set(&self, scope: &Scope, record: TokenRecord) -> Result<(), BrokerError> {
        if *scope == Scope::SiteRoot {
            return Err(anyhow::anyhow!("{} holds a URL, not a token record", SITE_ROOT_KEY).into());
        }
        tracing::debug!(scope = %scope, expires = record.expires, "Storing token");
        self.commit(scope.key().into_owned(), StoredEntry::Token(record))
            .await
    }

    /// Cached SharePoint root URL
    pub async fn site_root(&self) -> Option<String> {
        let entries = self.entries.read().await;
        match entries.get(SITE_ROOT_KEY) {
            Some(StoredEntry::Url(url)) if !url.is_empty() => Some(url.clone()),
            _ => None,
        }
    }

    pub async fn set_site_root(&self, url: String) -> Result<(), BrokerError> {
        tracing::debug!(url = %url, "Storing site root URL");
        self.commit(SITE_ROOT_KEY.to_string(), StoredEntry::Url(url))
            .await
    }

    /// Ordered copy of every entry
    pub async fn snapshot(&self) -> BTreeMap<String, StoredEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Persist a copy including the new entry, then swap it in. The write lock
    /// is held across the file write so the file never lags a later mutation.
    async fn commit(&self, key: String, entry: StoredEntry) -> Result<(), BrokerError> {
        let mut entries = self.entries.write().await;
        let mut updated = entries.clone();
        updated.insert(key, entry);

        let ordered: BTreeMap<&String, &StoredEntry> = updated.iter().collect();
        let data =
            serde_json::to_string_pretty(&ordered).context("Failed to serialize token store")?;
        write_atomic(&self.path, &data).await?;

        *entries = updated;
        Ok(())
    }
}

/// Parse and validate the persisted mapping
fn parse_entries(raw: &str) -> Result<HashMap<String, StoredEntry>> {
    let entries: HashMap<String, StoredEntry> =
        serde_json::from_str(raw).context("Failed to parse token store")?;

    for (key, entry) in &entries {
        match (key.as_str(), entry) {
            (SITE_ROOT_KEY, StoredEntry::Url(_)) => {}
            (SITE_ROOT_KEY, StoredEntry::Token(_)) => {
                anyhow::bail!("{} must be a plain URL string", SITE_ROOT_KEY)
            }
            (_, StoredEntry::Token(_)) => {}
            (other, StoredEntry::Url(_)) => {
                anyhow::bail!("{} must hold a secret and an expiry", other)
            }
        }
    }

    Ok(entries)
}

/// Write to a sibling temp file and rename over the target
async fn write_atomic(path: &Path, data: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let file_name = path
        .file_name()
        .context("Token store path has no file name")?
        .to_string_lossy();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;

    // Set restrictive permissions on the file (contains tokens)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set token store permissions")?;
    }

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
