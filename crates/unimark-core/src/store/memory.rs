//! In-memory [`EntityStore`] used by tests and demos.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;

use super::{Entity, EntityStore, Key, StoreError, Transaction};

type Row = BTreeMap<String, Value>;
type Table = BTreeMap<(String, String), Row>;

/// In-memory ordered store with the same transactional semantics as the
/// durable backends: `transact` holds the table lock for its whole body,
/// so transactions are serialized and all-or-nothing.
///
/// `inject_transient_faults` makes the next N read operations fail with
/// [`StoreError::Transient`], for exercising retry paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: Mutex<Table>,
    transient_faults: AtomicU32,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next `count` reads (`scan` / `get_many`) to fail
    /// with a transient error.
    pub fn inject_transient_faults(&self, count: u32) {
        self.transient_faults.store(count, Ordering::SeqCst);
    }

    /// Number of stored entities of `kind`.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        let rows = self.rows.lock().expect("store lock poisoned");
        rows.keys().filter(|(k, _)| k == kind).count()
    }

    fn consume_fault(&self) -> Result<(), StoreError> {
        let mut remaining = self.transient_faults.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.transient_faults.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(StoreError::Transient("injected fault".to_string())),
                Err(actual) => remaining = actual,
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Table>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

impl EntityStore for InMemoryStore {
    fn scan(
        &self,
        kind: &str,
        after: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entity>, StoreError> {
        self.consume_fault()?;
        let rows = self.lock()?;
        let lower = (kind.to_string(), after.unwrap_or("").to_string());
        let out = rows
            .range((Excluded(lower), Unbounded))
            .take_while(|((k, name), _)| k == kind && until.is_none_or(|u| name.as_str() <= u))
            .take(limit)
            .map(|((k, name), props)| Entity {
                key: Key::new(k.clone(), name.clone()),
                props: props.clone(),
            })
            .collect();
        Ok(out)
    }

    fn sample_keys(&self, kind: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let rows = self.lock()?;
        let names: Vec<&String> = rows
            .keys()
            .filter(|(k, _)| k == kind)
            .map(|(_, name)| name)
            .collect();
        if names.is_empty() || count == 0 {
            return Ok(Vec::new());
        }
        let step = names.len() / (count + 1);
        if step == 0 {
            return Ok(names.into_iter().cloned().collect());
        }
        let mut out: Vec<String> = (1..=count).map(|i| names[i * step - 1].clone()).collect();
        out.dedup();
        Ok(out)
    }

    fn get_many(&self, keys: &[Key]) -> Result<Vec<Option<Entity>>, StoreError> {
        self.consume_fault()?;
        let rows = self.lock()?;
        Ok(keys
            .iter()
            .map(|key| {
                rows.get(&(key.kind.clone(), key.name.clone()))
                    .map(|props| Entity {
                        key: key.clone(),
                        props: props.clone(),
                    })
            })
            .collect())
    }

    fn put_many(&self, entities: &[Entity]) -> Result<(), StoreError> {
        let mut rows = self.lock()?;
        for entity in entities {
            rows.insert(
                (entity.key.kind.clone(), entity.key.name.clone()),
                entity.props.clone(),
            );
        }
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), StoreError> {
        let mut rows = self.lock()?;
        rows.remove(&(key.kind.clone(), key.name.clone()));
        Ok(())
    }

    fn transact(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut rows = self.lock()?;
        let mut txn = MemTransaction {
            rows: &rows,
            staged: BTreeMap::new(),
        };
        body(&mut txn)?;
        let staged = txn.staged;
        for ((kind, name), row) in staged {
            match row {
                Some(props) => {
                    rows.insert((kind, name), props);
                }
                None => {
                    rows.remove(&(kind, name));
                }
            }
        }
        Ok(())
    }
}

/// Staged writes on top of the locked table. `None` marks a delete.
struct MemTransaction<'a> {
    rows: &'a Table,
    staged: BTreeMap<(String, String), Option<Row>>,
}

impl Transaction for MemTransaction<'_> {
    fn get(&mut self, key: &Key) -> Result<Option<Entity>, StoreError> {
        let composite = (key.kind.clone(), key.name.clone());
        let row = match self.staged.get(&composite) {
            Some(staged) => staged.clone(),
            None => self.rows.get(&composite).cloned(),
        };
        Ok(row.map(|props| Entity {
            key: key.clone(),
            props,
        }))
    }

    fn put(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.staged.insert(
            (entity.key.kind.clone(), entity.key.name.clone()),
            Some(entity.props),
        );
        Ok(())
    }

    fn delete(&mut self, key: &Key) -> Result<(), StoreError> {
        self.staged
            .insert((key.kind.clone(), key.name.clone()), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(kind: &str, name: &str) -> Entity {
        Entity::new(Key::new(kind, name))
    }

    fn seed(store: &InMemoryStore, kind: &str, names: &[&str]) {
        let entities: Vec<Entity> = names.iter().map(|n| entity(kind, n)).collect();
        store.put_many(&entities).unwrap();
    }

    #[test]
    fn scan_is_half_open_and_ordered() {
        let store = InMemoryStore::new();
        seed(&store, "m", &["a", "b", "c", "d"]);

        let all = store.scan("m", None, None, 100).unwrap();
        let names: Vec<&str> = all.iter().map(|e| e.key.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);

        let mid = store.scan("m", Some("a"), Some("c"), 100).unwrap();
        let names: Vec<&str> = mid.iter().map(|e| e.key.name.as_str()).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn scan_does_not_cross_kinds() {
        let store = InMemoryStore::new();
        seed(&store, "a_kind", &["x"]);
        seed(&store, "b_kind", &["y"]);
        let got = store.scan("a_kind", None, None, 100).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].key.name, "x");
    }

    #[test]
    fn sample_keys_small_domain_returns_all() {
        let store = InMemoryStore::new();
        seed(&store, "m", &["a", "b", "c"]);
        let samples = store.sample_keys("m", 9).unwrap();
        assert_eq!(samples, ["a", "b", "c"]);
    }

    #[test]
    fn sample_keys_large_domain_is_spread_and_bounded() {
        let store = InMemoryStore::new();
        let names: Vec<String> = (0..100).map(|i| format!("k{i:03}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        seed(&store, "m", &refs);
        let samples = store.sample_keys("m", 3).unwrap();
        assert_eq!(samples.len(), 3);
        let mut sorted = samples.clone();
        sorted.sort();
        assert_eq!(samples, sorted);
    }

    #[test]
    fn transact_is_all_or_nothing() {
        let store = InMemoryStore::new();
        seed(&store, "m", &["a"]);

        let result = store.transact(&mut |txn| {
            txn.put(entity("m", "b"))?;
            Err(StoreError::Backend("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.count("m"), 1);

        store
            .transact(&mut |txn| {
                txn.put(entity("m", "b"))?;
                txn.delete(&Key::new("m", "a"))
            })
            .unwrap();
        assert_eq!(store.count("m"), 1);
        let got = store.get_many(&[Key::new("m", "b")]).unwrap();
        assert!(got[0].is_some());
    }

    #[test]
    fn transaction_reads_observe_staged_writes() {
        let store = InMemoryStore::new();
        store
            .transact(&mut |txn| {
                txn.put(entity("m", "a"))?;
                assert!(txn.get(&Key::new("m", "a"))?.is_some());
                txn.delete(&Key::new("m", "a"))?;
                assert!(txn.get(&Key::new("m", "a"))?.is_none());
                Ok(())
            })
            .unwrap();
        assert_eq!(store.count("m"), 0);
    }

    #[test]
    fn injected_faults_are_transient_and_bounded() {
        let store = InMemoryStore::new();
        seed(&store, "m", &["a"]);
        store.inject_transient_faults(2);
        assert!(store.scan("m", None, None, 10).unwrap_err().is_transient());
        assert!(store.get_many(&[Key::new("m", "a")]).unwrap_err().is_transient());
        assert!(store.scan("m", None, None, 10).is_ok());
    }
}
