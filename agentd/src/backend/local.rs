//! Test/demo-grade backend that records actions and returns a synthetic
//! screenshot. Used by integration tests and as the CLI's default when no
//! real hardware/sandbox backend is wired (spec §1: the real backend is out
//! of scope).

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::BackendAction;

use super::{Backend, BackendError, BackendResult, with_backend_timeout};

/// A minimal valid 1x1 PNG, used as a stand-in screenshot.
const SYNTHETIC_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53, 0xDE, 0x00, 0x00, 0x00, 0x0C, 0x49,
    0x44, 0x41, 0x54, 0x08, 0xD7, 0x63, 0xF8, 0xCF, 0xC0, 0x00, 0x00, 0x03, 0x01, 0x01, 0x00, 0x18, 0xDD, 0x8D, 0xB0,
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Records every executed action for later inspection (test/demo use).
pub struct LocalNullBackend {
    log: Mutex<Vec<BackendAction>>,
}

impl LocalNullBackend {
    pub fn new() -> Self {
        Self { log: Mutex::new(Vec::new()) }
    }

    pub async fn executed_actions(&self) -> Vec<BackendAction> {
        self.log.lock().await.clone()
    }
}

impl Default for LocalNullBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalNullBackend {
    async fn execute(&self, action: &BackendAction, cancel: &CancellationToken) -> Result<BackendResult, BackendError> {
        debug!(verb = action.verb(), "LocalNullBackend::execute");
        self.log.lock().await.push(action.clone());
        with_backend_timeout(cancel, || async {
            match action {
                BackendAction::Screenshot => Ok(BackendResult::ok(Some(SYNTHETIC_PNG.to_vec()))),
                BackendAction::Fail => Ok(BackendResult::failure("synthetic failure")),
                BackendAction::Done { .. } => Ok(BackendResult::ok(None)),
                _ => Ok(BackendResult::ok(Some(SYNTHETIC_PNG.to_vec()))),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_every_action() {
        let backend = LocalNullBackend::new();
        let cancel = CancellationToken::new();
        backend.execute(&BackendAction::Screenshot, &cancel).await.unwrap();
        backend
            .execute(
                &BackendAction::Click {
                    xy: (1, 2),
                    button: crate::domain::MouseButton::Left,
                    count: 1,
                    hold_keys: vec![],
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(backend.executed_actions().await.len(), 2);
    }

    #[tokio::test]
    async fn screenshot_returns_observation() {
        let backend = LocalNullBackend::new();
        let cancel = CancellationToken::new();
        let result = backend.execute(&BackendAction::Screenshot, &cancel).await.unwrap();
        assert!(result.success);
        assert!(result.observation.is_some());
    }

    #[tokio::test]
    async fn fail_action_is_logical_failure_not_error() {
        let backend = LocalNullBackend::new();
        let cancel = CancellationToken::new();
        let result = backend.execute(&BackendAction::Fail, &cancel).await.unwrap();
        assert!(!result.success);
    }
}
