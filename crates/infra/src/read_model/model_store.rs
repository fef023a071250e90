use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use readsync_events::{Filter, ReadModel};

/// Read-model store failure (backend unavailable, timeout, ...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadModelError {
    #[error("read-model store unavailable: {0}")]
    Storage(String),
}

/// What an upsert did to the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row matched; the model was inserted.
    Inserted,
    /// A matching row was replaced.
    Replaced,
    /// A matching row already carries an equal or newer version; nothing changed.
    Stale { current: u64 },
}

/// Storage-agnostic read-model store for one model type.
///
/// Each call is a single atomic operation: it either fully succeeds or has no
/// effect. Callers may therefore be cancelled before or after a call, never
/// halfway through one.
#[async_trait]
pub trait ReadModelStore<M: ReadModel>: Send + Sync {
    /// Replace the row matching `filter` with `model`, or insert `model`.
    ///
    /// Rows whose embedded version is at least `model.version()` are never
    /// overwritten (the call reports [`UpsertOutcome::Stale`]).
    async fn upsert(&self, model: M, filter: Filter<M>) -> Result<UpsertOutcome, ReadModelError>;

    /// Remove every row matching `filter`; returns how many were removed.
    async fn delete(&self, filter: Filter<M>) -> Result<usize, ReadModelError>;

    /// Rows matching `filter`.
    async fn find(&self, filter: Filter<M>) -> Result<Vec<M>, ReadModelError>;

    /// Every row (rebuild/inspection support).
    async fn list(&self) -> Result<Vec<M>, ReadModelError>;

    /// Remove every row (rebuild support).
    async fn clear(&self) -> Result<(), ReadModelError>;
}

#[async_trait]
impl<M, S> ReadModelStore<M> for Arc<S>
where
    M: ReadModel,
    S: ReadModelStore<M> + ?Sized,
{
    async fn upsert(&self, model: M, filter: Filter<M>) -> Result<UpsertOutcome, ReadModelError> {
        (**self).upsert(model, filter).await
    }

    async fn delete(&self, filter: Filter<M>) -> Result<usize, ReadModelError> {
        (**self).delete(filter).await
    }

    async fn find(&self, filter: Filter<M>) -> Result<Vec<M>, ReadModelError> {
        (**self).find(filter).await
    }

    async fn list(&self) -> Result<Vec<M>, ReadModelError> {
        (**self).list().await
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        (**self).clear().await
    }
}

/// In-memory read-model store for tests/dev.
#[derive(Debug)]
pub struct InMemoryReadModelStore<M> {
    rows: RwLock<Vec<M>>,
}

impl<M> InMemoryReadModelStore<M> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }

    fn poisoned() -> ReadModelError {
        ReadModelError::Storage("lock poisoned".to_string())
    }
}

impl<M> Default for InMemoryReadModelStore<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M: ReadModel> ReadModelStore<M> for InMemoryReadModelStore<M> {
    async fn upsert(&self, model: M, filter: Filter<M>) -> Result<UpsertOutcome, ReadModelError> {
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;

        let matching: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| filter.matches(row))
            .map(|(idx, _)| idx)
            .collect();

        if let Some(current) = matching
            .iter()
            .map(|&idx| rows[idx].version())
            .filter(|&v| v >= model.version())
            .max()
        {
            return Ok(UpsertOutcome::Stale { current });
        }

        let Some((&first, rest)) = matching.split_first() else {
            rows.push(model);
            return Ok(UpsertOutcome::Inserted);
        };

        // Collapse multiple matches into one row; remove from the back so indices stay valid.
        rows[first] = model;
        for &idx in rest.iter().rev() {
            rows.remove(idx);
        }
        Ok(UpsertOutcome::Replaced)
    }

    async fn delete(&self, filter: Filter<M>) -> Result<usize, ReadModelError> {
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;
        let before = rows.len();
        rows.retain(|row| !filter.matches(row));
        Ok(before - rows.len())
    }

    async fn find(&self, filter: Filter<M>) -> Result<Vec<M>, ReadModelError> {
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        Ok(rows.iter().filter(|row| filter.matches(row)).cloned().collect())
    }

    async fn list(&self) -> Result<Vec<M>, ReadModelError> {
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        Ok(rows.clone())
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        self.rows.write().map_err(|_| Self::poisoned())?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: u32,
        name: &'static str,
        version: u64,
    }

    impl ReadModel for Row {
        fn version(&self) -> u64 {
            self.version
        }
    }

    fn by_id(id: u32) -> Filter<Row> {
        Filter::new(format!("id = {id}"), move |r: &Row| r.id == id)
    }

    fn row(id: u32, name: &'static str, version: u64) -> Row {
        Row { id, name, version }
    }

    #[tokio::test]
    async fn upsert_inserts_then_replaces() {
        let store = InMemoryReadModelStore::new();

        assert_eq!(
            store.upsert(row(1, "A", 1), by_id(1)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(row(1, "B", 2), by_id(1)).await.unwrap(),
            UpsertOutcome::Replaced
        );

        assert_eq!(store.list().await.unwrap(), vec![row(1, "B", 2)]);
    }

    #[tokio::test]
    async fn upsert_never_regresses_a_newer_row() {
        let store = InMemoryReadModelStore::new();
        store.upsert(row(1, "B", 2), by_id(1)).await.unwrap();

        let outcome = store.upsert(row(1, "A", 1), by_id(1)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale { current: 2 });

        // Same version again is also a no-op (idempotent redelivery).
        let outcome = store.upsert(row(1, "B", 2), by_id(1)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale { current: 2 });

        assert_eq!(store.list().await.unwrap(), vec![row(1, "B", 2)]);
    }

    #[tokio::test]
    async fn upsert_collapses_multiple_matches() {
        let store = InMemoryReadModelStore::new();
        store.upsert(row(1, "A", 1), by_id(1)).await.unwrap();
        store.upsert(row(2, "A", 1), by_id(2)).await.unwrap();

        let by_name = Filter::new("name = A", |r: &Row| r.name == "A");
        store.upsert(row(3, "C", 5), by_name).await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec![row(3, "C", 5)]);
    }

    #[tokio::test]
    async fn delete_removes_all_matches_and_tolerates_none() {
        let store = InMemoryReadModelStore::new();
        store.upsert(row(1, "A", 1), by_id(1)).await.unwrap();
        store.upsert(row(2, "B", 1), by_id(2)).await.unwrap();

        assert_eq!(store.delete(by_id(1)).await.unwrap(), 1);
        assert_eq!(store.delete(by_id(1)).await.unwrap(), 0);
        assert_eq!(store.find(by_id(2)).await.unwrap().len(), 1);
    }
}
