//! Persistence collaborator.
//!
//! The station never manages transactions itself: every call is synchronous and
//! either fully succeeds or returns an error.

use crate::error::{KestrelError, Result};
use crate::types::{AccessLevel, Sequence, TestRecord};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Narrow persistence surface consumed by the station.
pub trait TestStore: Send + Sync {
    /// Insert a temporary row for the running test of `serial`.
    fn insert_temp_row(&self, serial: &str, sequence: Sequence, record: &TestRecord) -> Result<()>;

    /// Drop every temporary row for `serial`.
    fn clear_temp_rows(&self, serial: &str) -> Result<()>;

    /// Rows cached for `serial`, in insertion order, used when a run resumes.
    fn cached_rows(&self, serial: &str, sequence: Sequence) -> Result<Vec<TestRecord>>;

    /// Access level of a user, `None` when the user is unknown.
    fn user_access_level(&self, user_id: &str) -> Result<Option<AccessLevel>>;

    /// Commit a finished printout for `serial`.
    fn commit_printout(&self, serial: &str, printout: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryTables {
    temp_rows: HashMap<(String, Sequence), Vec<TestRecord>>,
    users: HashMap<String, AccessLevel>,
    printouts: HashMap<String, Vec<String>>,
}

/// In-memory store used by default and in tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a user.
    pub fn with_user(self, user_id: impl Into<String>, level: AccessLevel) -> Self {
        if let Ok(mut tables) = self.tables.lock() {
            tables.users.insert(user_id.into(), level);
        }
        self
    }

    /// Printouts committed for `serial`, oldest first.
    pub fn printouts(&self, serial: &str) -> Result<Vec<String>> {
        let tables = self.lock()?;
        Ok(tables.printouts.get(serial).cloned().unwrap_or_default())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| KestrelError::Store("store lock poisoned".to_string()))
    }
}

impl TestStore for MemoryStore {
    fn insert_temp_row(&self, serial: &str, sequence: Sequence, record: &TestRecord) -> Result<()> {
        if serial.is_empty() {
            return Err(KestrelError::Store(
                "cannot insert a row without a serial number".to_string(),
            ));
        }
        let mut tables = self.lock()?;
        tables
            .temp_rows
            .entry((serial.to_string(), sequence))
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn clear_temp_rows(&self, serial: &str) -> Result<()> {
        let mut tables = self.lock()?;
        tables.temp_rows.retain(|(s, _), _| s != serial);
        debug!("Cleared temporary rows for {}", serial);
        Ok(())
    }

    fn cached_rows(&self, serial: &str, sequence: Sequence) -> Result<Vec<TestRecord>> {
        let tables = self.lock()?;
        Ok(tables
            .temp_rows
            .get(&(serial.to_string(), sequence))
            .cloned()
            .unwrap_or_default())
    }

    fn user_access_level(&self, user_id: &str) -> Result<Option<AccessLevel>> {
        let tables = self.lock()?;
        Ok(tables.users.get(user_id).copied())
    }

    fn commit_printout(&self, serial: &str, printout: &str) -> Result<()> {
        if serial.is_empty() {
            return Err(KestrelError::BoardNotFound("<empty serial>".to_string()));
        }
        let mut tables = self.lock()?;
        tables
            .printouts
            .entry(serial.to_string())
            .or_default()
            .push(printout.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_rows_round_trip_per_sequence() -> Result<()> {
        let store = MemoryStore::new();
        store.insert_temp_row("SN1", Sequence::Test, &TestRecord::new("a", "PASS"))?;
        store.insert_temp_row("SN1", Sequence::Diagnostic, &TestRecord::new("b", "INFO"))?;
        store.insert_temp_row("SN2", Sequence::Test, &TestRecord::new("c", "PASS"))?;

        assert_eq!(store.cached_rows("SN1", Sequence::Test)?.len(), 1);
        assert_eq!(store.cached_rows("SN1", Sequence::Diagnostic)?.len(), 1);

        store.clear_temp_rows("SN1")?;
        assert!(store.cached_rows("SN1", Sequence::Test)?.is_empty());
        assert_eq!(store.cached_rows("SN2", Sequence::Test)?.len(), 1);
        Ok(())
    }

    #[test]
    fn rejects_rows_without_serial() {
        let store = MemoryStore::new();
        let result = store.insert_temp_row("", Sequence::Test, &TestRecord::new("a", "PASS"));
        assert!(matches!(result, Err(KestrelError::Store(_))));
    }

    #[test]
    fn user_levels() -> Result<()> {
        let store = MemoryStore::new().with_user("tech7", AccessLevel::Technician);
        assert_eq!(store.user_access_level("tech7")?, Some(AccessLevel::Technician));
        assert_eq!(store.user_access_level("nobody")?, None);
        Ok(())
    }

    #[test]
    fn printouts_accumulate() -> Result<()> {
        let store = MemoryStore::new();
        store.commit_printout("SN1", "first")?;
        store.commit_printout("SN1", "second")?;
        assert_eq!(store.printouts("SN1")?, vec!["first", "second"]);
        Ok(())
    }
}
