use crate::error::Result;
use crate::state::{DiscoveryState, StatePatch};
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};

/// Receives every state snapshot produced by the [`StateStore`]
#[async_trait]
pub trait StateObserver: Send + Sync {
    async fn on_state_change(&self, state: &DiscoveryState) -> Result<()>;

    /// Name used in log messages
    fn name(&self) -> &str {
        "observer"
    }
}

struct FnObserver<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> StateObserver for FnObserver<F>
where
    F: Fn(&DiscoveryState) -> Result<()> + Send + Sync,
{
    async fn on_state_change(&self, state: &DiscoveryState) -> Result<()> {
        (self.f)(state)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a synchronous closure as an observer
pub fn observer_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn StateObserver>
where
    F: Fn(&DiscoveryState) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnObserver {
        name: name.into(),
        f,
    })
}

type ObserverList = Arc<RwLock<Vec<Arc<dyn StateObserver>>>>;

enum Dispatch {
    Notify(DiscoveryState),
    Flush(oneshot::Sender<()>),
}

struct StoreInner {
    state: DiscoveryState,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
}

/// Owner of the single current [`DiscoveryState`]
///
/// Mutations happen under one lock and are queued for delivery in the same
/// order. A dispatcher task hands each snapshot to all observers (concurrently
/// with each other) and waits for them before taking the next one, so
/// notifications of distinct updates never interleave. Observers may call
/// [`update`](Self::update) themselves; that only enqueues another snapshot.
///
/// Must be created inside a Tokio runtime.
pub struct StateStore {
    inner: Mutex<StoreInner>,
    observers: ObserverList,
}

impl StateStore {
    /// Create a store in the initial `Idle` state
    pub fn new() -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));

        tokio::spawn(dispatch_loop(dispatch_rx, observers.clone()));

        Self {
            inner: Mutex::new(StoreInner {
                state: DiscoveryState::default(),
                dispatch_tx,
            }),
            observers,
        }
    }

    /// Independent copy of the current state
    pub fn get(&self) -> DiscoveryState {
        self.lock().state.clone()
    }

    /// Apply a partial update and return the new state
    pub fn update(&self, patch: impl Into<StatePatch>) -> DiscoveryState {
        let patch = patch.into();
        let mut inner = self.lock();
        inner.state.apply(patch);
        let snapshot = inner.state.clone();
        Self::enqueue(&inner, snapshot.clone());

        tracing::debug!(
            "State updated: status={}, progress={}%",
            snapshot.status.as_str(),
            snapshot.progress.percentage
        );
        snapshot
    }

    /// Return to the initial `Idle` state
    pub fn reset(&self) -> DiscoveryState {
        let mut inner = self.lock();
        inner.state = DiscoveryState::default();
        let snapshot = inner.state.clone();
        Self::enqueue(&inner, snapshot.clone());

        tracing::debug!("State reset to idle");
        snapshot
    }

    /// Register an observer; returns `false` if it was already registered
    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        if observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return false;
        }
        tracing::debug!("Observer subscribed: {}", observer.name());
        observers.push(observer);
        true
    }

    /// Remove an observer; returns `false` if it was not registered
    pub fn unsubscribe(&self, observer: &Arc<dyn StateObserver>) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        let removed = observers.len() != before;
        if removed {
            tracing::debug!("Observer unsubscribed: {}", observer.name());
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait until every snapshot enqueued so far has been delivered
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let inner = self.lock();
            if inner.dispatch_tx.send(Dispatch::Flush(tx)).is_err() {
                return;
            }
        }
        let _ = rx.await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(inner: &StoreInner, snapshot: DiscoveryState) {
        if inner.dispatch_tx.send(Dispatch::Notify(snapshot)).is_err() {
            tracing::debug!("State dispatcher is gone, dropping notification");
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>, observers: ObserverList) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Dispatch::Notify(state) => notify_observers(&observers, &state).await,
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("State dispatcher stopped");
}

async fn notify_observers(observers: &ObserverList, state: &DiscoveryState) {
    let observers: Vec<Arc<dyn StateObserver>> = observers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if observers.is_empty() {
        return;
    }

    tracing::debug!("Notifying {} observers", observers.len());

    let deliveries = observers.iter().map(|observer| async move {
        match AssertUnwindSafe(observer.on_state_change(state))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Error notifying observer {}: {}", observer.name(), e);
            }
            Err(_) => {
                tracing::error!("Observer {} panicked during notification", observer.name());
            }
        }
    });
    join_all(deliveries).await;
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
