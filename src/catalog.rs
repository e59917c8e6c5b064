//! In-memory catalog registry: names → editions of content hashes, with
//! observer notification.
//!
//! A catalog tracks the succession of wares published under one stable
//! name. The registry protects its maps with a single mutex; publishes
//! replace the whole book. Observers subscribe with a bounded channel
//! and are notified after every publish — dispatch happens outside the
//! lock against a snapshot of the subscriber list, so a subscriber that
//! re-enters the registry from its receive loop cannot deadlock it.

use std::collections::HashMap;
use std::sync::mpsc::SyncSender;
use std::sync::Mutex;
use tracing::debug;

/// Stable name of one catalog.
pub type CatalogId = String;

/// The published state of one catalog: its ordered editions, newest
/// last. Each edition is a ware hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Book {
    pub id: CatalogId,
    pub editions: Vec<String>,
}

impl Book {
    /// The newest edition, if any has been published.
    pub fn latest(&self) -> Option<&str> {
        self.editions.last().map(String::as_str)
    }
}

#[derive(Default)]
struct Registry {
    books: HashMap<CatalogId, Book>,
    observers: Vec<SyncSender<CatalogId>>,
}

/// The catalog store.
#[derive(Default)]
pub struct CatalogStore {
    inner: Mutex<Registry>,
}

impl CatalogStore {
    pub fn new() -> CatalogStore {
        CatalogStore::default()
    }

    /// Reads the current book for a catalog.
    pub fn catalog(&self, id: &str) -> Option<Book> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        inner.books.get(id).cloned()
    }

    /// Lists all known catalog ids.
    pub fn list_catalogs(&self) -> Vec<CatalogId> {
        let inner = self.inner.lock().expect("catalog lock poisoned");
        inner.books.keys().cloned().collect()
    }

    /// Subscribes to publish notifications. The channel should be
    /// bounded; a slow observer blocks the publisher, not the registry.
    pub fn observe_catalogs(&self, observer: SyncSender<CatalogId>) {
        let mut inner = self.inner.lock().expect("catalog lock poisoned");
        inner.observers.push(observer);
    }

    /// Publishes a book, replacing any previous edition list, and
    /// notifies every observer.
    pub fn publish_catalog(&self, book: Book) {
        let id = book.id.clone();
        let observers = {
            let mut inner = self.inner.lock().expect("catalog lock poisoned");
            inner.books.insert(id.clone(), book);
            inner.observers.clone()
        };
        debug!(catalog = %id, observers = observers.len(), "catalog published");
        for observer in observers {
            let _ = observer.send(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn publish_then_read() {
        let store = CatalogStore::new();
        store.publish_catalog(Book {
            id: "project/tools".to_string(),
            editions: vec!["sha256:aa".to_string(), "sha256:bb".to_string()],
        });

        let book = store.catalog("project/tools").unwrap();
        assert_eq!(book.latest(), Some("sha256:bb"));
        assert_eq!(store.list_catalogs(), vec!["project/tools".to_string()]);
    }

    #[test]
    fn observers_hear_publishes() {
        let store = CatalogStore::new();
        let (tx, rx) = sync_channel(4);
        store.observe_catalogs(tx);

        store.publish_catalog(Book {
            id: "a".to_string(),
            editions: vec![],
        });
        store.publish_catalog(Book {
            id: "b".to_string(),
            editions: vec![],
        });

        assert_eq!(rx.recv().unwrap(), "a");
        assert_eq!(rx.recv().unwrap(), "b");
    }

    #[test]
    fn observer_may_reenter_registry() {
        // A subscriber that reads the registry upon notification must
        // not deadlock against the publishing thread.
        let store = std::sync::Arc::new(CatalogStore::new());
        let (tx, rx) = sync_channel(1);
        store.observe_catalogs(tx);

        let reader = {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                let id = rx.recv().unwrap();
                store.catalog(&id).is_some()
            })
        };

        store.publish_catalog(Book {
            id: "loop".to_string(),
            editions: vec!["sha256:cc".to_string()],
        });
        assert!(reader.join().unwrap());
    }
}
