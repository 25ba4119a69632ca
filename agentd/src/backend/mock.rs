//! Scriptable backend for dispatcher state-machine tests (spec §8 S1-S5).

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::BackendAction;

use super::{Backend, BackendError, BackendResult};

/// Replays a fixed queue of results, one per `execute` call, regardless of
/// which action was passed in. The last scripted result repeats once the
/// queue is drained, so tests don't need to script every remaining call.
pub struct MockBackend {
    results: Mutex<Vec<BackendResult>>,
    calls: Mutex<Vec<BackendAction>>,
}

impl MockBackend {
    pub fn new(results: Vec<BackendResult>) -> Self {
        Self {
            results: Mutex::new(results),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(vec![BackendResult::ok(Some(vec![0u8]))])
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn execute(&self, action: &BackendAction, _cancel: &CancellationToken) -> Result<BackendResult, BackendError> {
        self.calls.lock().await.push(action.clone());
        let mut results = self.results.lock().await;
        if results.len() > 1 {
            Ok(results.remove(0))
        } else if let Some(last) = results.first() {
            Ok(last.clone())
        } else {
            Ok(BackendResult::ok(None))
        }
    }
}
