//! Timeout and cancellation handling for asynchronous transport calls
//! Every BLE call made by the connection logic goes through [`OperationGuard`],
//! which races it against a per-kind timeout and the current generation.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{
    BLUETOOTH_OPERATION_TIMEOUT_SECS, SHORT_OPERATION_TIMEOUT_SECS,
};
use crate::core::bluetooth::error::{Cancelled, OperationError, TransportError};

/// Kinds of guarded operations, each with a fixed timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    GetDeviceName,
    GetDeviceFromAddress,
    GetDeviceInfo,
    SetCurrentDevice,
    GetHeartRateService,
    GetGenericAccessService,
    GetHeartRateCharacteristic,
    GetDeviceNameCharacteristic,
    WriteCharacteristicConfigDescriptor,
    ReadHeartRateValue,
    StartWatcher,
    StopWatcher,
    SubscribeValueChanged,
    SubscribeConnectionStatus,
}

impl OperationKind {
    pub fn timeout(self) -> Duration {
        match self {
            Self::WriteCharacteristicConfigDescriptor | Self::ReadHeartRateValue => {
                Duration::from_secs(SHORT_OPERATION_TIMEOUT_SECS)
            }
            _ => Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cancellation scope of one session generation.
///
/// Cloned into every in-flight operation. Replacing the generation cancels the
/// token and bumps the epoch, so continuations can tell they are stale even if
/// the operation itself finished just before the cancellation.
#[derive(Debug, Clone)]
pub struct Generation {
    epoch: u64,
    token: CancellationToken,
}

impl Generation {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            token: CancellationToken::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancels this generation and returns its successor
    pub fn invalidate(&mut self) -> Generation {
        self.token.cancel();
        let next = Generation {
            epoch: self.epoch + 1,
            token: CancellationToken::new(),
        };
        *self = next.clone();
        next
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

/// Races operations against their timeout and the generation's cancellation
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationGuard;

impl OperationGuard {
    pub fn new() -> Self {
        Self
    }

    /// Awaits `operation`, yielding `Ok(None)` on timeout and `Err(Cancelled)`
    /// if the generation is invalidated first.
    pub async fn wait<F>(
        &self,
        operation: F,
        kind: OperationKind,
        scope: &Generation,
    ) -> Result<Option<F::Output>, Cancelled>
    where
        F: Future,
    {
        if scope.is_cancelled() {
            return Err(Cancelled);
        }
        let budget = kind.timeout();
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                debug!("Task {} cancelled", kind);
                Err(Cancelled)
            }
            result = timeout(budget, operation) => match result {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    debug!("Task {} timed out after {}s", kind, budget.as_secs_f64());
                    Ok(None)
                }
            }
        }
    }

    /// Like [`wait`](Self::wait) for fallible transport calls: the transport
    /// error is propagated, a timeout still degrades to `Ok(None)`.
    pub async fn attempt<T, F>(
        &self,
        operation: F,
        kind: OperationKind,
        scope: &Generation,
    ) -> Result<Option<T>, OperationError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        match self.wait(operation, kind, scope).await? {
            Some(result) => result.map(Some).map_err(OperationError::from),
            None => Ok(None),
        }
    }
}
