//! Live decode progress, scoped per caller session
//!
//! Entries are keyed by session and progress id together, so a poller from
//! one session can never see another session's progress.

use serde::Serialize;
use std::sync::Arc;

use crate::store::TokenStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub done: bool,
}

#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn TokenStore<Progress>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn TokenStore<Progress>>) -> Self {
        Self { store }
    }

    fn key(session: &str, progress_id: &str) -> String {
        format!("{}\u{0}{}", session, progress_id)
    }

    pub async fn start(&self, session: &str, progress_id: &str, total: usize) -> ProgressHandle {
        let key = Self::key(session, progress_id);
        self.store
            .put(
                key.clone(),
                Progress {
                    completed: 0,
                    total,
                    done: false,
                },
            )
            .await;
        ProgressHandle {
            store: self.store.clone(),
            key,
            total,
        }
    }

    /// `None` when the entry is unknown, expired or belongs to another session
    pub async fn get(&self, session: &str, progress_id: &str) -> Option<Progress> {
        self.store.get(&Self::key(session, progress_id)).await
    }
}

/// Write side of one progress entry, owned by the running decode
pub struct ProgressHandle {
    store: Arc<dyn TokenStore<Progress>>,
    key: String,
    total: usize,
}

impl ProgressHandle {
    pub async fn update(&self, completed: usize) {
        self.store
            .put(
                self.key.clone(),
                Progress {
                    completed,
                    total: self.total,
                    done: false,
                },
            )
            .await;
    }

    pub async fn finish(&self) {
        self.store
            .put(
                self.key.clone(),
                Progress {
                    completed: self.total,
                    total: self.total,
                    done: true,
                },
            )
            .await;
    }
}
