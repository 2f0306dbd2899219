use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use teloxide::types::{ChatId, UserId};

use crate::lookup::LookupType;

/// Who a pending lookup belongs to. Only the same user, in the same chat,
/// can supply its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub chat: ChatId,
    pub user: UserId,
}

/// Lookups whose type was chosen and whose term is still awaited.
#[derive(Debug)]
pub struct PendingLookups {
    timeout: Duration,
    entries: Mutex<HashMap<PendingKey, (LookupType, Instant)>>,
}

impl PendingLookups {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces whatever the key was waiting for before.
    pub fn begin(&self, key: PendingKey, kind: LookupType) {
        self.begin_at(key, kind, Instant::now());
    }

    pub fn take(&self, key: PendingKey) -> Option<LookupType> {
        self.take_at(key, Instant::now())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn begin_at(&self, key: PendingKey, kind: LookupType, now: Instant) {
        let mut entries = self.entries();
        entries.retain(|_, (_, since)| !self.expired(*since, now));
        entries.insert(key, (kind, now));
    }

    fn take_at(&self, key: PendingKey, now: Instant) -> Option<LookupType> {
        let (kind, since) = self.entries().remove(&key)?;
        if self.expired(since, now) {
            tracing::debug!(?key, %kind, "Pending lookup expired.");
            return None;
        }
        Some(kind)
    }

    fn expired(&self, since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(since) > self.timeout
    }

    fn entries(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<PendingKey, (LookupType, Instant)>>
    {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
