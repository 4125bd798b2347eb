use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::store::{DocumentStore, ProcessedEventDocument, StoreError};

#[derive(Debug, Clone)]
enum ScriptedFailure {
    Conflict,
    Unavailable(String),
}

/// Concurrent in-memory document store. Upserts overwrite by id.
///
/// Failures can be scripted per document id; each scripted failure applies to the next
/// upsert of that id only.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, ProcessedEventDocument>,
    scripted: Mutex<HashMap<String, ScriptedFailure>>,
    upserts: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_scripted(&self) -> MutexGuard<'_, HashMap<String, ScriptedFailure>> {
        match self.scripted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The next upsert of `id` reports a write conflict, as if a concurrent writer won
    pub fn conflict_once(&self, id: &str) {
        self.lock_scripted()
            .insert(id.to_string(), ScriptedFailure::Conflict);
    }

    /// The next upsert of `id` fails with [`StoreError::Unavailable`]
    pub fn fail_once(&self, id: &str, reason: &str) {
        self.lock_scripted()
            .insert(id.to_string(), ScriptedFailure::Unavailable(reason.to_string()));
    }

    pub fn get(&self, id: &str) -> Option<ProcessedEventDocument> {
        self.documents.get(id).map(|doc| doc.value().clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Upsert attempts that reached the store, including scripted failures
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, document: &ProcessedEventDocument) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);

        let scripted = self.lock_scripted().remove(&document.id);
        match scripted {
            Some(ScriptedFailure::Conflict) => Err(StoreError::Conflict(document.id.clone())),
            Some(ScriptedFailure::Unavailable(reason)) => Err(StoreError::Unavailable(reason)),
            None => {
                self.documents.insert(document.id.clone(), document.clone());
                Ok(())
            }
        }
    }
}
