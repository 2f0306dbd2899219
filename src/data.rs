use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{NaiveDate, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed ledger document")]
    Json(#[from] serde_json::Error),

    #[error("Ledger store lock poisoned")]
    Poisoned,

    #[error("Ledger store task failed")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid or expired code")]
    InvalidCode,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(
    serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq,
)]
pub struct UserRecord {
    /// Day the count belongs to. Absent for users created by a redemption.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub premium: bool,
}

impl UserRecord {
    /// Uses counted against `today`; a record from another day counts none.
    #[must_use]
    pub fn count_on(&self, today: NaiveDate) -> u32 {
        if self.date == Some(today) {
            self.count
        } else {
            0
        }
    }

    fn reset_if_stale(&mut self, today: NaiveDate) {
        if self.date != Some(today) {
            self.date = Some(today);
            self.count = 0;
        }
    }
}

#[derive(
    serde::Serialize, serde::Deserialize, Debug, Clone, Default, PartialEq, Eq,
)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub users: BTreeMap<i64, UserRecord>,

    /// Code -> remaining uses.
    #[serde(default)]
    pub gift_codes: BTreeMap<String, u32>,
}

/// Whole-document storage. Every ledger operation loads before acting and
/// saves right after.
pub trait Store: Send + Sync {
    fn load(&self) -> Result<Document, StorageError>;
    fn save(&self, doc: &Document) -> Result<(), StorageError>;
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates the file, holding an empty document, if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let selph = Self {
            path: path.as_ref().to_path_buf(),
        };
        let exists = fs::exists(&selph.path).map_err(|source| {
            StorageError::Read {
                path: selph.path.clone(),
                source,
            }
        })?;
        if !exists {
            tracing::info!(path = ?selph.path, "Creating empty ledger.");
            selph.save(&Document::default())?;
        }
        Ok(selph)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Store for JsonFileStore {
    fn load(&self) -> Result<Document, StorageError> {
        let data = fs::read_to_string(&self.path).map_err(|source| {
            StorageError::Read {
                path: self.path.clone(),
                source,
            }
        })?;
        let doc = serde_json::from_str(&data)?;
        Ok(doc)
    }

    /// Temp file in the same directory, then rename over the target, so a
    /// reader never sees a half-written document.
    fn save(&self, doc: &Document) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(doc)?;
        let write_err = |source| StorageError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_err)?;
        let mut temp_file =
            tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        temp_file.write_all(json.as_bytes()).map_err(write_err)?;
        temp_file.flush().map_err(write_err)?;
        temp_file
            .persist(&self.path)
            .map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<Document>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(doc: Document) -> Self {
        Self {
            doc: Mutex::new(doc),
        }
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Document, StorageError> {
        let doc = self.doc.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(doc.clone())
    }

    fn save(&self, doc: &Document) -> Result<(), StorageError> {
        let mut current =
            self.doc.lock().map_err(|_| StorageError::Poisoned)?;
        *current = doc.clone();
        Ok(())
    }
}

#[derive(serde::Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub used_today: u32,
    /// `None` for premium users.
    pub remaining_today: Option<u32>,
    pub premium: bool,
}

#[derive(serde::Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LedgerStats {
    pub users: usize,
    pub premium_users: usize,
    pub active_today: usize,
    pub live_codes: usize,
}

/// Daily usage counter and gift-code book kept in a [`Store`].
///
/// All operations are serialized through one lock, so concurrent uses by
/// the same user within this process cannot lose an increment. Processes
/// sharing one file are not coordinated. Store I/O runs on the blocking
/// pool.
pub struct Ledger {
    store: Arc<dyn Store>,
    daily_limit: u32,
    lock: tokio::sync::Mutex<()>,
}

impl Ledger {
    pub fn new(store: impl Store + 'static, daily_limit: u32) -> Self {
        Self {
            store: Arc::new(store),
            daily_limit,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub async fn check_quota(&self, uid: i64) -> Result<bool, StorageError> {
        self.check_quota_on(uid, today()).await
    }

    pub async fn record_use(
        &self,
        uid: i64,
    ) -> Result<UserRecord, StorageError> {
        self.record_use_on(uid, today()).await
    }

    pub async fn usage(&self, uid: i64) -> Result<Usage, StorageError> {
        self.usage_on(uid, today()).await
    }

    pub async fn stats(&self) -> Result<LedgerStats, StorageError> {
        self.stats_on(today()).await
    }

    /// Runs `f` under the ledger lock, off the async workers.
    async fn with_store<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StorageError> + Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T, E> + Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(StorageError::from)?
    }

    async fn check_quota_on(
        &self,
        uid: i64,
        today: NaiveDate,
    ) -> Result<bool, StorageError> {
        let limit = self.daily_limit;
        self.with_store(move |store| {
            let doc = store.load()?;
            let has_quota = doc.users.get(&uid).map_or(true, |user| {
                user.premium || user.count_on(today) < limit
            });
            Ok::<_, StorageError>(has_quota)
        })
        .await
    }

    async fn record_use_on(
        &self,
        uid: i64,
        today: NaiveDate,
    ) -> Result<UserRecord, StorageError> {
        let user = self
            .with_store(move |store| {
                let mut doc = store.load()?;
                let user = doc.users.entry(uid).or_default();
                user.reset_if_stale(today);
                user.count = user.count.saturating_add(1);
                let user = user.clone();
                store.save(&doc)?;
                Ok::<_, StorageError>(user)
            })
            .await?;
        tracing::debug!(uid, count = user.count, "Recorded use.");
        Ok(user)
    }

    async fn usage_on(
        &self,
        uid: i64,
        today: NaiveDate,
    ) -> Result<Usage, StorageError> {
        let limit = self.daily_limit;
        self.with_store(move |store| {
            let doc = store.load()?;
            let user = doc.users.get(&uid).cloned().unwrap_or_default();
            let used_today = user.count_on(today);
            let remaining_today =
                (!user.premium).then(|| limit.saturating_sub(used_today));
            Ok::<_, StorageError>(Usage {
                used_today,
                remaining_today,
                premium: user.premium,
            })
        })
        .await
    }

    async fn stats_on(
        &self,
        today: NaiveDate,
    ) -> Result<LedgerStats, StorageError> {
        self.with_store(move |store| {
            let doc = store.load()?;
            Ok::<_, StorageError>(LedgerStats {
                users: doc.users.len(),
                premium_users: doc.users.values().filter(|u| u.premium).count(),
                active_today: doc
                    .users
                    .values()
                    .filter(|u| u.count_on(today) > 0)
                    .count(),
                live_codes: doc.gift_codes.values().filter(|n| **n > 0).count(),
            })
        })
        .await
    }

    /// Grants premium and spends one use of `code`. An unknown or exhausted
    /// code leaves the document untouched.
    pub async fn redeem(&self, code: &str, uid: i64) -> Result<(), LedgerError> {
        let code = code.to_string();
        let left = self
            .with_store(move |store| {
                let mut doc = store.load()?;
                let remaining = match doc.gift_codes.get_mut(&code) {
                    Some(remaining) if *remaining > 0 => remaining,
                    _ => return Err(LedgerError::InvalidCode),
                };
                *remaining -= 1;
                let left = *remaining;
                doc.users.entry(uid).or_default().premium = true;
                store.save(&doc)?;
                Ok(left)
            })
            .await?;
        tracing::info!(uid, left, "Gift code redeemed.");
        Ok(())
    }

    /// Creates `code`, replacing any previous use count.
    pub async fn create_code(
        &self,
        code: &str,
        uses: u32,
    ) -> Result<(), StorageError> {
        let code = code.to_string();
        self.with_store(move |store| {
            let mut doc = store.load()?;
            doc.gift_codes.insert(code, uses);
            store.save(&doc)
        })
        .await?;
        tracing::info!(uses, "Gift code created.");
        Ok(())
    }

    /// Makes the user known (for broadcasts) without spending any quota.
    pub async fn register(&self, uid: i64) -> Result<(), StorageError> {
        let date = today();
        let added = self
            .with_store(move |store| {
                let mut doc = store.load()?;
                if doc.users.contains_key(&uid) {
                    return Ok(false);
                }
                doc.users.insert(
                    uid,
                    UserRecord {
                        date: Some(date),
                        count: 0,
                        premium: false,
                    },
                );
                store.save(&doc)?;
                Ok::<_, StorageError>(true)
            })
            .await?;
        if added {
            tracing::info!(uid, "Registered new user.");
        }
        Ok(())
    }

    pub async fn user_ids(&self) -> Result<Vec<i64>, StorageError> {
        self.with_store(|store| {
            let doc = store.load()?;
            Ok::<_, StorageError>(doc.users.keys().copied().collect())
        })
        .await
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
