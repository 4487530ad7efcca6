pub mod availability;
mod conflict;
mod error;
mod locks;
mod mutations;
mod queries;

pub use availability::{is_available, merge_overlapping, subtract_intervals, unavailable_spans};
pub use error::{EngineError, ErrorKind};
pub use locks::WorkspaceLocks;
pub use mutations::ReapReport;
pub use queries::AssignmentStatus;

use std::future::Future;
use std::sync::Arc;

use ulid::Ulid;

use crate::store::Store;

pub type EngineResult<T> = Result<T, EngineError>;

/// The reservation engine. Every write that can violate a reservation
/// invariant runs under the lock of each workspace it touches.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    locks: Arc<WorkspaceLocks>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: Arc::new(WorkspaceLocks::new()),
        }
    }

    pub fn locks(&self) -> &WorkspaceLocks {
        &self.locks
    }

    /// Run `section` holding the locks of `ids`. Once the locks are taken the
    /// section runs on its own task and keeps them until it finishes, even if
    /// the caller stops waiting (request deadline, client gone).
    pub(crate) async fn locked<T, F>(&self, ids: &[Ulid], section: impl FnOnce(Engine) -> F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guards = self.locks.lock_many(ids).await;
        let section = section(self.clone());
        tokio::spawn(async move {
            let _guards = guards;
            section.await
        })
        .await
        .map_err(|e| EngineError::Storage(format!("write task failed: {e}")))?
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
