//! A single-flight call table: at most one execution per key is in
//! flight at a time, and its result is fanned out to every caller that
//! joined while it ran.
//!
//! The table is executor-agnostic. The caller that opens a call supplies
//! the work future; whichever joined caller polls first drives it, and
//! driving migrates to a surviving caller if the current driver's future
//! is dropped. When every caller's future is dropped before completion,
//! the work future is dropped with them and the call is evicted.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use slab::Slab;

type CallTable<T, E> = Mutex<HashMap<String, Arc<Call<T, E>>>>;

/// A class of work within which calls for equal keys are deduplicated.
pub struct Group<T: 'static, E: 'static> {
    calls: Arc<CallTable<T, E>>,
}

impl<T: 'static, E: 'static> Clone for Group<T, E> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T: 'static, E: 'static> Default for Group<T, E> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

struct Call<T: 'static, E: 'static> {
    state: Mutex<CallState<T, E>>,
}

struct CallState<T: 'static, E: 'static> {
    /// Work future supplied by the caller that opened the call. Taken out
    /// of the slot while a driver polls it; gone for good once an outcome
    /// is stored or the call is abandoned.
    work: Option<BoxFuture<'static, Result<T, E>>>,
    /// Written exactly once, by the driver that polled `work` to
    /// completion.
    outcome: Option<Result<T, E>>,
    /// Wakers of callers parked while someone else drives.
    wakers: Slab<Waker>,
    /// Callers that ever joined this call. Never decremented; `joined > 1`
    /// is the shared flag.
    joined: usize,
    /// Callers whose `Work` future is alive and unresolved.
    active: usize,
    /// The work future panicked while being driven.
    panicked: bool,
    /// The work future was dropped before producing an outcome.
    abandoned: bool,
}

impl<T: 'static, E: 'static> CallState<T, E> {
    fn park(&mut self, slot: &mut Option<usize>, cx: &Context<'_>) {
        match slot {
            Some(key) => {
                if let Some(waker) = self.wakers.get_mut(*key) {
                    waker.clone_from(cx.waker());
                } else {
                    *slot = Some(self.wakers.insert(cx.waker().clone()));
                }
            }
            None => *slot = Some(self.wakers.insert(cx.waker().clone())),
        }
    }

    fn unpark(&mut self, slot: &mut Option<usize>) {
        if let Some(key) = slot.take() {
            self.wakers.try_remove(key);
        }
    }

    fn wake_all(&mut self) {
        for waker in self.wakers.drain() {
            waker.wake();
        }
    }
}

impl<T: 'static, E: 'static> Group<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight call for `key`, or opens a new one.
    ///
    /// `make` is invoked only in the caller that opens the call, while the
    /// table lock is held; it must only construct the work future, not run
    /// it, and must not call back into this group.
    ///
    /// The returned [`Work`] resolves to the call's result and a flag that
    /// is true iff the result was delivered to more than one caller.
    pub fn work(&self, key: &str, make: impl FnOnce() -> BoxFuture<'static, Result<T, E>>) -> Work<T, E> {
        let mut calls = self.calls.lock();

        if let Some(call) = calls.get(key) {
            let mut state = call.state.lock();
            // An abandoned entry can linger briefly between the last
            // caller's departure and its eviction; it has no work future
            // left, so it cannot serve a new caller.
            if !state.abandoned && !state.panicked {
                state.joined += 1;
                state.active += 1;
                drop(state);
                return Work {
                    calls: Arc::clone(&self.calls),
                    key: key.to_owned(),
                    call: Arc::clone(call),
                    parked: None,
                    resolved: false,
                };
            }
        }

        let call = Arc::new(Call {
            state: Mutex::new(CallState {
                work: Some(make()),
                outcome: None,
                wakers: Slab::new(),
                joined: 1,
                active: 1,
                panicked: false,
                abandoned: false,
            }),
        });
        calls.insert(key.to_owned(), Arc::clone(&call));

        Work {
            calls: Arc::clone(&self.calls),
            key: key.to_owned(),
            call,
            parked: None,
            resolved: false,
        }
    }

    /// Drops the record for `key` so the next arrival opens a fresh call.
    ///
    /// Callers already joined to the old call keep it and receive its
    /// result; the old work future is not cancelled.
    pub fn forget(&self, key: &str) {
        self.calls.lock().remove(key);
    }

    /// Number of keys with a call currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Removes `call` from the table iff it is still the entry for `key`.
///
/// The entry may already have been replaced by `forget` followed by a new
/// arrival; a stale caller must not evict its successor.
fn evict<T: 'static, E: 'static>(calls: &CallTable<T, E>, key: &str, call: &Arc<Call<T, E>>) {
    let mut calls = calls.lock();
    if calls.get(key).map_or(false, |cur| Arc::ptr_eq(cur, call)) {
        calls.remove(key);
    }
}

/// One caller's handle on a deduplicated call.
///
/// Dropping it before completion withdraws the caller; the last caller to
/// withdraw takes the work future down with it.
pub struct Work<T: 'static, E: 'static> {
    calls: Arc<CallTable<T, E>>,
    key: String,
    call: Arc<Call<T, E>>,
    parked: Option<usize>,
    resolved: bool,
}

/// Marks the call panicked and wakes the parked callers if the driver
/// unwinds out of the work future's poll.
struct DriveGuard<'a, T: 'static, E: 'static> {
    calls: &'a CallTable<T, E>,
    key: &'a str,
    call: &'a Arc<Call<T, E>>,
    finished: bool,
}

impl<T: 'static, E: 'static> Drop for DriveGuard<'_, T, E> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        evict(self.calls, self.key, self.call);
        let mut state = self.call.state.lock();
        state.panicked = true;
        state.wake_all();
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Future for Work<T, E> {
    type Output = (Result<T, E>, bool);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.resolved {
            panic!("Work polled after completion");
        }

        let mut state = this.call.state.lock();

        if let Some(outcome) = &state.outcome {
            let value = outcome.clone();
            let shared = state.joined > 1;
            state.unpark(&mut this.parked);
            state.active -= 1;
            this.resolved = true;
            return Poll::Ready((value, shared));
        }

        if state.panicked {
            state.unpark(&mut this.parked);
            state.active -= 1;
            this.resolved = true;
            // Release the lock before unwinding into the caller.
            drop(state);
            panic!("scopeflight: shared call panicked");
        }

        let Some(mut work) = state.work.take() else {
            // Someone else holds the work future right now; park until the
            // outcome lands or a departing driver wakes us to take over.
            state.park(&mut this.parked, cx);
            return Poll::Pending;
        };
        drop(state);

        let mut guard = DriveGuard {
            calls: this.calls.as_ref(),
            key: &this.key,
            call: &this.call,
            finished: false,
        };
        let poll = work.as_mut().poll(cx);
        guard.finished = true;
        drop(guard);

        match poll {
            Poll::Pending => {
                let mut state = this.call.state.lock();
                state.work = Some(work);
                state.park(&mut this.parked, cx);
                Poll::Pending
            }
            Poll::Ready(value) => {
                // Run the work future's teardown before anything else can
                // observe the completed generation, then evict the entry so
                // the next arrival starts fresh, then publish the outcome
                // to the callers still parked on this call.
                drop(work);
                evict(&this.calls, &this.key, &this.call);

                let mut state = this.call.state.lock();
                state.outcome = Some(value.clone());
                state.wake_all();
                let shared = state.joined > 1;
                state.unpark(&mut this.parked);
                state.active -= 1;
                this.resolved = true;
                Poll::Ready((value, shared))
            }
        }
    }
}

impl<T: 'static, E: 'static> Drop for Work<T, E> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut state = self.call.state.lock();
        state.unpark(&mut self.parked);
        state.active -= 1;
        if state.outcome.is_some() || state.panicked {
            return;
        }
        if state.active == 0 {
            state.abandoned = true;
            let work = state.work.take();
            drop(state);
            tracing::trace!(key = %self.key, "in-flight call abandoned");
            evict(&self.calls, &self.key, &self.call);
            // Dropping the work future last: its teardown may take locks
            // of its own.
            drop(work);
        } else {
            // The departing caller may have been the driver, with the work
            // future's wakers pointing at its dead task. Prod the survivors
            // so one of them re-polls and takes over.
            for (_, waker) in state.wakers.iter() {
                waker.wake_by_ref();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::sync::Barrier;
    use tokio::time::sleep;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicates_share_one_execution() {
        let group: Group<&'static str, ()> = Group::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(3));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let group = group.clone();
            let runs = Arc::clone(&runs);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                group
                    .work("fetch", || {
                        let runs = Arc::clone(&runs);
                        async move {
                            sleep(Duration::from_millis(100)).await;
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok("payload")
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for task in tasks {
            let (value, _) = task.await.unwrap();
            assert_eq!(value, Ok("payload"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn lone_caller_is_not_shared() {
        let group: Group<u32, ()> = Group::new();
        let (value, shared) = group.work("k", || async { Ok(7) }.boxed()).await;
        assert_eq!(value, Ok(7));
        assert!(!shared);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_run_separately() {
        let group: Group<u32, ()> = Group::new();
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            let (value, shared) = group
                .work("k", || {
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    }
                    .boxed()
                })
                .await;
            assert_eq!(value, Ok(1));
            assert!(!shared);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forget_starts_a_fresh_call() {
        let group: Group<&'static str, ()> = Group::new();
        let gate = Arc::new(tokio::sync::Notify::new());

        let slow = {
            let gate = Arc::clone(&gate);
            group.work("k", || {
                async move {
                    gate.notified().await;
                    Ok("slow")
                }
                .boxed()
            })
        };
        let slow = tokio::spawn(slow);
        // Let the slow call take the driver's seat before forgetting it.
        sleep(Duration::from_millis(20)).await;

        group.forget("k");
        let (value, shared) = group.work("k", || async { Ok("fast") }.boxed()).await;
        assert_eq!(value, Ok("fast"));
        assert!(!shared);

        gate.notify_one();
        let (value, _) = slow.await.unwrap();
        assert_eq!(value, Ok("slow"));
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropping_every_caller_abandons_the_work() {
        let group: Group<u32, ()> = Group::new();
        let work = group.work("k", || futures::future::pending().boxed());
        drop(work);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn survivor_takes_over_driving() {
        let group: Group<&'static str, ()> = Group::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let make = {
            let runs = Arc::clone(&runs);
            move || {
                async move {
                    sleep(Duration::from_millis(50)).await;
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok("payload")
                }
                .boxed()
            }
        };

        let first = group.work("k", make);
        let second = group.work("k", || unreachable!("call is already open"));
        drop(first);

        let (value, shared) = second.await;
        assert_eq!(value, Ok("payload"));
        assert!(shared);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    async fn boom() -> Result<(), ()> {
        panic!("boom")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panics_propagate_to_every_caller() {
        let group: Group<(), ()> = Group::new();

        let first = group.work("k", || boom().boxed());
        let second = group.work("k", || unreachable!("call is already open"));

        let first = tokio::spawn(first).await;
        assert!(first.unwrap_err().is_panic());
        let second = tokio::spawn(second).await;
        assert!(second.unwrap_err().is_panic());
        assert_eq!(group.in_flight(), 0);
    }
}
