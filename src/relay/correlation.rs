//! Request/response matching over the single upstream connection.
//!
//! Each outbound correlated request registers a one-shot slot under a fresh
//! random `request_id`. The upstream read loop resolves slots by id; the
//! waiting task races that against its deadline and an optional
//! cancellation token. A [`Registration`] guard removes the slot on drop, so
//! every exit path (response, timeout, cancel, dropped future) cleans up.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RelayError;
use crate::util::random_id;

type Slot<R> = oneshot::Sender<Result<R, RelayError>>;

/// Pending requests of one kind, keyed by `request_id`.
pub struct PendingRequests<R> {
    kind: &'static str,
    slots: Mutex<HashMap<String, Slot<R>>>,
}

/// Keeps a slot registered; unregisters it when dropped.
pub struct Registration<'a, R> {
    table: &'a PendingRequests<R>,
    request_id: String,
    rx: oneshot::Receiver<Result<R, RelayError>>,
}

impl<R> PendingRequests<R> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<R>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new slot under a fresh id.
    pub fn register(&self) -> Registration<'_, R> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots();
        let mut request_id = random_id();
        while slots.contains_key(&request_id) {
            request_id = random_id();
        }
        slots.insert(request_id.clone(), tx);
        Registration {
            table: self,
            request_id,
            rx,
        }
    }

    /// Hand `value` to the waiter for `request_id`.
    ///
    /// Returns `false` when nobody is waiting (unknown id, already resolved,
    /// or the waiter gave up). Never blocks.
    pub fn resolve(&self, request_id: &str, value: R) -> bool {
        let Some(slot) = self.slots().remove(request_id) else {
            debug!(kind = self.kind, request_id, "Response for unknown request (dropped)");
            return false;
        };
        slot.send(Ok(value)).is_ok()
    }

    /// Resolve every outstanding waiter with `error()`. Returns the count.
    pub fn fail_all(&self, error: impl Fn() -> RelayError) -> usize {
        let drained: Vec<Slot<R>> = self.slots().drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for slot in drained {
            let _ = slot.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl<R> Registration<'_, R> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response, the deadline, or `cancel`, whichever is first.
    ///
    /// A slot dropped without a value (table torn down) reads as
    /// [`RelayError::PluginOffline`].
    pub async fn wait(
        mut self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<R, RelayError> {
        let canceled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, &mut self.rx) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(RelayError::PluginOffline),
                Err(_) => {
                    debug!(kind = self.table.kind, request_id = %self.request_id, "Correlated request timed out");
                    Err(RelayError::Timeout)
                }
            },
            () = canceled => Err(RelayError::Canceled),
        }
    }
}

impl<R> Drop for Registration<'_, R> {
    fn drop(&mut self) {
        self.table.slots().remove(&self.request_id);
    }
}
