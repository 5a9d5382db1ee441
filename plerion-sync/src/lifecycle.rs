//! Single-flight start/stop for a long-running resource.
//!
//! ```text
//!          start(op) ok                      stop(stop_op)
//!   Idle ──► Starting ──────────► Running ──► Stopping ──► Idle
//!              │ error / cancel                  ▲ error still ends Idle
//!              └────────────► Idle               │
//!                        start while Running ────┘ (implicit stop)
//! ```
//!
//! A resource started with [`AsyncLifecycleGuard::start_with_stop`] leaves
//! its teardown behind. An implicit stop awaits that teardown before the
//! next operation runs; an explicit [`stop`](AsyncLifecycleGuard::stop)
//! runs its own `stop_op` instead and discards it.
//!
//! Calls are sequenced through one gate. A new `start` or a `stop` first
//! cancels the token of the operation in flight (or of the running
//! resource), then waits for the gate, so two starts never both reach
//! `Running`. Whatever way a start ends, including its future being
//! dropped, the state falls back to `Idle` unless it reached `Running`.
//!
//! Cancellation is cooperative: the operation is abandoned at its next
//! await point once its token fires.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{select_all, BoxFuture};
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(E),
}

/// Owner side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSource {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            receivers: vec![self.tx.subscribe()],
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Fires when any of its sources is cancelled. The default token never
/// fires.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    receivers: Vec<watch::Receiver<bool>>,
}

impl CancelToken {
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receivers.iter().any(|rx| *rx.borrow())
    }

    /// A token that fires when either `self` or `other` does.
    pub fn merge(&self, other: &CancelToken) -> CancelToken {
        let mut receivers = self.receivers.clone();
        receivers.extend(other.receivers.iter().cloned());
        CancelToken { receivers }
    }

    /// Resolves once cancelled. A source dropped without cancelling never
    /// resolves.
    pub async fn cancelled(&self) {
        if self.receivers.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.receivers.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                if closed {
                    std::future::pending::<()>().await;
                }
            })
        });
        select_all(waits).await;
    }
}

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Inner {
    state: watch::Sender<LifecycleState>,
    gate: AsyncMutex<()>,
    /// Source of the operation in flight, or of the running resource.
    current: Mutex<Option<CancelSource>>,
    /// Teardown of the running resource.
    teardown: Mutex<Option<Teardown>>,
}

impl Inner {
    fn current(&self) -> MutexGuard<'_, Option<CancelSource>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self) -> MutexGuard<'_, Option<Teardown>> {
        self.teardown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_current(&self) {
        if let Some(source) = self.current().as_ref() {
            source.cancel();
        }
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("lifecycle {previous:?} -> {state:?}");
        }
    }

    fn finish(&self) {
        self.current().take();
        self.teardown().take();
        self.set_state(LifecycleState::Idle);
    }
}

/// Returns the guard to `Idle` when dropped while armed.
struct ResetOnDrop<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.finish();
        }
    }
}

/// Cloneable handle; clones share one state machine.
#[derive(Clone)]
pub struct AsyncLifecycleGuard {
    inner: Arc<Inner>,
}

impl Default for AsyncLifecycleGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AsyncLifecycleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLifecycleGuard")
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncLifecycleGuard {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            inner: Arc::new(Inner {
                state,
                gate: AsyncMutex::new(()),
                current: Mutex::new(None),
                teardown: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Run `op` as the new start operation.
    ///
    /// `op` gets a token that fires on `cancel`, on `stop`, or on a later
    /// `start`. The token stays live after `op` returns, so a resource
    /// spawned by `op` can hold it to learn when it is being stopped.
    pub async fn start<F, Fut, E>(&self, cancel: &CancelToken, op: F) -> Result<(), GuardError<E>>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.start_with_stop(cancel, op, || async {}).await
    }

    /// Like [`start`](Self::start), and on success keep `on_stop` as the
    /// resource's teardown. A later `start` awaits it, after the resource
    /// token has fired, before running its own operation.
    pub async fn start_with_stop<F, Fut, E, S, SFut>(
        &self,
        cancel: &CancelToken,
        op: F,
        on_stop: S,
    ) -> Result<(), GuardError<E>>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        S: FnOnce() -> SFut + Send + 'static,
        SFut: Future<Output = ()> + Send + 'static,
    {
        self.inner.cancel_current();
        let _gate = self.inner.gate.lock().await;

        if self.state() == LifecycleState::Running {
            log::debug!("start while running, stopping the previous resource");
            self.inner.set_state(LifecycleState::Stopping);
            self.inner.cancel_current();
            let teardown = self.inner.teardown().take();
            let _reset = ResetOnDrop {
                inner: &self.inner,
                armed: true,
            };
            if let Some(teardown) = teardown {
                teardown().await;
            }
        }
        if cancel.is_cancelled() {
            return Err(GuardError::Cancelled);
        }

        let source = CancelSource::new();
        *self.inner.current() = Some(source.clone());
        self.inner.set_state(LifecycleState::Starting);
        let mut reset = ResetOnDrop {
            inner: &self.inner,
            armed: true,
        };

        let token = source.token().merge(cancel);
        let result = tokio::select! {
            biased;
            result = op(token.clone()) => result.map_err(GuardError::Failed),
            _ = token.cancelled() => Err(GuardError::Cancelled),
        };
        if result.is_ok() {
            reset.armed = false;
            let teardown: Teardown =
                Box::new(move || -> BoxFuture<'static, ()> { Box::pin(on_stop()) });
            *self.inner.teardown() = Some(teardown);
            self.inner.set_state(LifecycleState::Running);
        }
        result
    }

    /// Stop the running resource with `stop_op`.
    ///
    /// An in-flight start is cancelled and awaited first. `stop_op` only
    /// runs if the state was `Running`; the guard ends `Idle` even if it
    /// fails. A teardown kept by `start_with_stop` is dropped unrun.
    pub async fn stop<F, Fut, E>(&self, stop_op: F) -> Result<(), GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.inner.cancel_current();
        let _gate = self.inner.gate.lock().await;
        if self.state() != LifecycleState::Running {
            return Ok(());
        }
        self.inner.set_state(LifecycleState::Stopping);
        let _reset = ResetOnDrop {
            inner: &self.inner,
            armed: true,
        };
        stop_op().await.map_err(GuardError::Failed)
    }
}
