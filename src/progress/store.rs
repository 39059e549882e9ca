use crate::progress::error::ProgressResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Field-map key/value store with per-key expiry.
///
/// Writes to different fields of one key are independent: there is no
/// ordering between them, and the last write to a field wins.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Set fields on `key` and re-arm its expiry to `ttl`.
    async fn set_fields(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> ProgressResult<()>;

    /// Set a numeric field only if `value` exceeds the stored value (or the
    /// field is absent). Returns whether the value was written.
    async fn set_field_if_greater(
        &self,
        key: &str,
        field: &str,
        value: f64,
        ttl: Duration,
    ) -> ProgressResult<bool>;

    /// Current field map; empty if the key is absent or expired.
    async fn get_all(&self, key: &str) -> ProgressResult<HashMap<String, String>>;

    /// Re-arm the expiry of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> ProgressResult<bool>;

    async fn remove(&self, key: &str) -> ProgressResult<bool>;

    /// Drop every expired key; returns how many were dropped.
    async fn purge_expired(&self) -> ProgressResult<usize>;
}

struct Entry {
    fields: HashMap<String, String>,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process [`ProgressStore`].
#[derive(Default)]
pub struct MemoryProgressStore {
    entries: DashMap<String, Entry>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live_entry<'a>(
        &'a self,
        key: &str,
        ttl: Duration,
    ) -> dashmap::mapref::one::RefMut<'a, String, Entry> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            fields: HashMap::new(),
            expires_at: now + ttl,
        });
        if entry.is_expired(now) {
            entry.fields.clear();
        }
        entry.expires_at = now + ttl;
        entry
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn set_fields(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Duration,
    ) -> ProgressResult<()> {
        let mut entry = self.live_entry(key, ttl);
        for (field, value) in fields {
            entry.fields.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn set_field_if_greater(
        &self,
        key: &str,
        field: &str,
        value: f64,
        ttl: Duration,
    ) -> ProgressResult<bool> {
        let mut entry = self.live_entry(key, ttl);
        let current = entry
            .fields
            .get(field)
            .and_then(|v| v.parse::<f64>().ok());

        match current {
            Some(current) if current >= value => Ok(false),
            _ => {
                entry.fields.insert(field.to_string(), format_number(value));
                Ok(true)
            }
        }
    }

    async fn get_all(&self, key: &str) -> ProgressResult<HashMap<String, String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.fields.clone())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ProgressResult<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> ProgressResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn purge_expired(&self) -> ProgressResult<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// Render whole numbers without a fractional part ("40" rather than "40.0").
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
