use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::Mutex;
use pin_project::pin_project;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::singleflight;

#[cfg(any(feature = "use-async-std", feature = "use-tokio"))]
use futures::channel::oneshot;
#[cfg(any(feature = "use-async-std", feature = "use-tokio"))]
use crate::spawner::Spawner;

type ScopeTable = Mutex<HashMap<String, Arc<KeyScope>>>;

/// A class of work within which calls for equal keys are deduplicated and
/// the shared execution's cancellation scope is synthesized from the
/// callers' scopes.
///
/// The scope handed to the work function is a fresh root token, never a
/// child of any caller's token: it is cancelled exactly when every
/// registered caller's token has fired, or when the function has returned.
/// Clones share the same state; a `Group` is reusable indefinitely.
pub struct Group<T: 'static, E: 'static> {
    scopes: Arc<ScopeTable>,
    sf: singleflight::Group<T, E>,
}

impl<T: 'static, E: 'static> Clone for Group<T, E> {
    fn clone(&self) -> Self {
        Self {
            scopes: Arc::clone(&self.scopes),
            sf: self.sf.clone(),
        }
    }
}

impl<T: 'static, E: 'static> Default for Group<T, E> {
    fn default() -> Self {
        Self {
            scopes: Arc::new(Mutex::new(HashMap::new())),
            sf: singleflight::Group::default(),
        }
    }
}

/// Result of a finished call, as delivered on the [`Group::work_chan`]
/// channel.
#[derive(Debug, Clone)]
pub struct Outcome<T, E> {
    /// What the work function returned.
    pub value: Result<T, E>,
    /// True iff the value was delivered to more than one caller.
    pub shared: bool,
}

/// Per-key coordination record: the shared token handed to the work
/// function, and the count of callers still interested in it.
struct KeyScope {
    token: CancellationToken,
    participants: AtomicUsize,
}

impl KeyScope {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            participants: AtomicUsize::new(0),
        }
    }

    fn join(&self) {
        self.participants.fetch_add(1, Ordering::SeqCst);
    }

    /// The decrement observing zero cancels the shared token; no reaper
    /// task exists.
    fn leave(&self) {
        if self.participants.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.token.cancel();
        }
    }
}

/// One caller's registration under a [`KeyScope`]. Leaves exactly once,
/// on drop.
struct Participant {
    scope: Arc<KeyScope>,
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.scope.leave();
    }
}

/// Teardown of a key generation, captured by the leader's work future so
/// it runs when that future is dropped: on normal return, on
/// cancellation-induced return, on panic unwind, and on abandonment alike.
struct KeyTeardown {
    scopes: Arc<ScopeTable>,
    key: String,
    scope: Arc<KeyScope>,
}

impl Drop for KeyTeardown {
    fn drop(&mut self) {
        // Cancelling on normal completion too lets watchers inside the
        // work function terminate.
        self.scope.token.cancel();
        let mut scopes = self.scopes.lock();
        if scopes
            .get(&self.key)
            .map_or(false, |cur| Arc::ptr_eq(cur, &self.scope))
        {
            scopes.remove(&self.key);
            tracing::trace!(key = %self.key, "key scope closed");
        }
    }
}

impl<T, E> Group<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` for `key`, deduplicating against every overlapping call
    /// with the same key.
    ///
    /// If no call for `key` is in flight, `f` is invoked with the key's
    /// shared cancellation scope; otherwise the returned [`Flight`] waits
    /// for the in-flight call and receives the same result. The flag in
    /// the output is true iff the result was delivered to more than one
    /// caller.
    ///
    /// `caller` expresses this caller's interest, not its wait: cancelling
    /// it withdraws the caller from the shared scope but the `Flight`
    /// still resolves with the shared result. Only when every registered
    /// caller has cancelled is the scope seen by `f` cancelled, at which
    /// point `f` is expected to bail out promptly with whatever error it
    /// maps cancellation to. Dropping the `Flight` withdraws the caller
    /// entirely; the work is aborted only when every caller's `Flight` is
    /// gone.
    ///
    /// Registration happens in this call, before the future is polled.
    pub fn work<F, Fut>(&self, caller: &CancellationToken, key: &str, f: F) -> Flight<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let scope = self.register(key);
        let participant = Participant {
            scope: Arc::clone(&scope),
        };

        let scopes = Arc::clone(&self.scopes);
        let owned_key = key.to_owned();
        let inner = self.sf.work(key, move || {
            let teardown = KeyTeardown {
                scopes,
                key: owned_key,
                scope,
            };
            let token = teardown.scope.token.clone();
            async move {
                let _teardown = teardown;
                f(token).await
            }
            .boxed()
        });

        Flight {
            cancelled: caller.clone().cancelled_owned(),
            participant: Some(participant),
            inner,
        }
    }

    /// Like [`Group::work`], but hands the wait to a spawned task and
    /// returns a channel on which the [`Outcome`] is delivered.
    ///
    /// The channel carries exactly one value. It closes without one only
    /// if the work function panics, which takes the spawned task down
    /// with it. Dropping the receiver does not withdraw the caller; its
    /// registration ends when the spawned task finishes.
    #[cfg(any(feature = "use-async-std", feature = "use-tokio"))]
    pub fn work_chan<S, F, Fut>(
        &self,
        spawner: &S,
        caller: &CancellationToken,
        key: &str,
        f: F,
    ) -> oneshot::Receiver<Outcome<T, E>>
    where
        S: Spawner,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let flight = self.work(caller, key, f);
        let (tx, rx) = oneshot::channel();
        spawner.spawn(async move {
            let (value, shared) = flight.await;
            let _ = tx.send(Outcome { value, shared });
        });
        rx
    }

    /// Drops the deduplication record for `key`: the next call starts a
    /// fresh execution even if the current one has not finished.
    ///
    /// The in-flight execution is not cancelled, and the key's
    /// coordination scope is left alone; callers already waiting receive
    /// the old result.
    pub fn forget(&self, key: &str) {
        tracing::trace!(key, "forgetting in-flight call");
        self.sf.forget(key);
    }

    /// Fetches or creates the key's scope and registers the caller under
    /// it. The counter moves while the table is locked, so the entry
    /// cannot be torn down between the lookup and the registration.
    fn register(&self, key: &str) -> Arc<KeyScope> {
        let mut scopes = self.scopes.lock();
        let scope = scopes.entry(key.to_owned()).or_insert_with(|| {
            tracing::trace!(key, "key scope opened");
            Arc::new(KeyScope::new())
        });
        scope.join();
        Arc::clone(scope)
    }

    /// Number of keys with a live coordination scope.
    pub fn live_scopes(&self) -> usize {
        self.scopes.lock().len()
    }

    /// Number of keys with a deduplicated call in flight.
    pub fn in_flight(&self) -> usize {
        self.sf.in_flight()
    }
}

/// The future returned by [`Group::work`].
///
/// Resolves to the shared result and the shared flag. While pending it
/// watches the caller's token: when that fires, the caller is withdrawn
/// from the key's scope exactly once, and the wait continues.
#[pin_project]
#[must_use = "a Flight does nothing and holds its registration until polled or dropped"]
pub struct Flight<T: 'static, E: 'static> {
    #[pin]
    cancelled: WaitForCancellationFutureOwned,
    participant: Option<Participant>,
    inner: singleflight::Work<T, E>,
}

impl<T, E> Future for Flight<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    type Output = (Result<T, E>, bool);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.participant.is_some() && this.cancelled.poll(cx).is_ready() {
            // The caller gave up: withdraw from the key scope, but keep
            // waiting so the shared result is still delivered here.
            *this.participant = None;
        }
        Pin::new(this.inner).poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_cancels_when_the_last_participant_leaves() {
        let scope = KeyScope::new();
        scope.join();
        scope.join();
        scope.leave();
        assert!(!scope.token.is_cancelled());
        scope.leave();
        assert!(scope.token.is_cancelled());
    }

    #[test]
    fn teardown_spares_a_successor_generation() {
        let scopes: Arc<ScopeTable> = Arc::new(Mutex::new(HashMap::new()));
        let old = Arc::new(KeyScope::new());
        let fresh = Arc::new(KeyScope::new());
        scopes.lock().insert("k".to_owned(), Arc::clone(&fresh));

        drop(KeyTeardown {
            scopes: Arc::clone(&scopes),
            key: "k".to_owned(),
            scope: old,
        });

        let table = scopes.lock();
        assert!(Arc::ptr_eq(table.get("k").unwrap(), &fresh));
        assert!(!fresh.token.is_cancelled());
    }
}
