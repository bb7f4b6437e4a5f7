//! Single-flight refresh coordination
//!
//! The coordinator owns the client's refresh state:
//!
//! - `Idle`: no refresh in flight
//! - `Refreshing`: exactly one refresh in flight, zero or more requests queued
//!
//! A request that hits a 401 calls `admit_request()`. Under one lock the
//! coordinator either makes it the leader (`Idle` → `Refreshing`) or pushes it
//! onto the queue. The leader runs the refresh, then calls
//! `RefreshGuard::settle()`, which takes the queue and returns to `Idle` in the
//! same critical section, and hands the outcome to every waiter with
//! `Settled::deliver()`. If the leader is dropped before settling, the guard
//! returns to `Idle` and rejects every queued request with `RefreshAbandoned`.
//!
//! Waiters replay their own requests once they hold the new session, so a
//! replay never depends on the leader's future staying alive. The order is
//! kept by a chain of `ReplayTurn`s: the leader starts first, then each queued
//! request in enqueue order. A turn whose holder is gone passes on by itself.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::refresh::RefreshedSession;

/// What a queued request receives when its refresh cycle succeeds.
pub(crate) struct QueuedReplay {
    pub(crate) session: RefreshedSession,
    pub(crate) turn: ReplayTurn,
}

/// A request that failed with 401 while a refresh was in flight.
struct PendingRequest {
    route: String,
    respond_to: oneshot::Sender<Result<QueuedReplay>>,
}

/// A caller of an explicit refresh that joined an in-flight cycle.
type SessionWaiter = oneshot::Sender<Result<RefreshedSession>>;

/// Place of one replay in the start order of its cycle.
pub(crate) struct ReplayTurn {
    after: Option<oneshot::Receiver<()>>,
    then: Option<oneshot::Sender<()>>,
}

impl ReplayTurn {
    /// Wait until the previous replay of the cycle has started.
    pub(crate) async fn wait(&mut self) {
        if let Some(previous) = self.after.take() {
            // Err means the previous holder is gone, which also frees the turn
            let _ = previous.await;
        }
    }

    /// Let the next replay start.
    pub(crate) fn pass(&mut self) {
        if let Some(next) = self.then.take() {
            let _ = next.send(());
        }
    }
}

#[derive(Default)]
enum RefreshState {
    #[default]
    Idle,
    Refreshing {
        queue: Vec<PendingRequest>,
        observers: Vec<SessionWaiter>,
    },
}

impl RefreshState {
    fn refreshing() -> Self {
        RefreshState::Refreshing {
            queue: Vec::new(),
            observers: Vec::new(),
        }
    }
}

/// Result of `admit_request()`.
pub(crate) enum RequestAdmission<'a> {
    /// This request starts the refresh.
    Lead(RefreshGuard<'a>),
    /// A refresh is already in flight; the receiver yields its outcome.
    Queued(oneshot::Receiver<Result<QueuedReplay>>),
}

/// Result of `admit_refresh()`.
pub(crate) enum RefreshAdmission<'a> {
    Lead(RefreshGuard<'a>),
    Joined(oneshot::Receiver<Result<RefreshedSession>>),
}

#[derive(Default)]
pub(crate) struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // Critical sections run no user code, so a poisoned lock still guards a
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `route` only labels the queue entry in logs.
    pub(crate) fn admit_request(&self, route: &str) -> RequestAdmission<'_> {
        let mut state = self.lock();
        if let RefreshState::Refreshing { queue, .. } = &mut *state {
            let (respond_to, rx) = oneshot::channel();
            queue.push(PendingRequest {
                route: route.to_string(),
                respond_to,
            });
            debug!(queued = queue.len(), path = %route, "refresh in flight, request queued");
            return RequestAdmission::Queued(rx);
        }
        *state = RefreshState::refreshing();
        drop(state);
        RequestAdmission::Lead(RefreshGuard::new(self))
    }

    pub(crate) fn admit_refresh(&self) -> RefreshAdmission<'_> {
        let mut state = self.lock();
        if let RefreshState::Refreshing { observers, .. } = &mut *state {
            let (tx, rx) = oneshot::channel();
            observers.push(tx);
            return RefreshAdmission::Joined(rx);
        }
        *state = RefreshState::refreshing();
        drop(state);
        RefreshAdmission::Lead(RefreshGuard::new(self))
    }

    pub(crate) fn is_refreshing(&self) -> bool {
        matches!(*self.lock(), RefreshState::Refreshing { .. })
    }

    pub(crate) fn queued(&self) -> usize {
        match &*self.lock() {
            RefreshState::Refreshing { queue, .. } => queue.len(),
            RefreshState::Idle => 0,
        }
    }

    /// Return to `Idle`, handing back everything that waited on this cycle.
    fn release(&self) -> Settled {
        match std::mem::take(&mut *self.lock()) {
            RefreshState::Refreshing { queue, observers } => Settled { queue, observers },
            RefreshState::Idle => Settled::default(),
        }
    }
}

/// Leadership of the current refresh cycle.
pub(crate) struct RefreshGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl<'a> RefreshGuard<'a> {
    fn new(coordinator: &'a RefreshCoordinator) -> Self {
        Self {
            coordinator,
            settled: false,
        }
    }

    /// End the cycle: back to `Idle`, waiters handed to the leader.
    pub(crate) fn settle(mut self) -> Settled {
        self.settled = true;
        self.coordinator.release()
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let settled = self.coordinator.release();
        if !settled.is_empty() {
            warn!(
                queued = settled.queue.len(),
                "refresh abandoned, rejecting queued requests"
            );
        }
        settled.deliver(&Err(Error::RefreshAbandoned));
    }
}

/// Everything that waited on one refresh cycle, in arrival order.
#[derive(Default)]
pub(crate) struct Settled {
    queue: Vec<PendingRequest>,
    observers: Vec<SessionWaiter>,
}

impl Settled {
    fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.observers.is_empty()
    }

    /// Hand the outcome to every waiter: queued requests in enqueue order,
    /// then explicit-refresh callers.
    ///
    /// Returns the leader's turn, which comes before every queued replay.
    pub(crate) fn deliver(self, outcome: &Result<RefreshedSession>) -> ReplayTurn {
        let (first, mut after) = oneshot::channel();
        let leader = ReplayTurn {
            after: None,
            then: Some(first),
        };

        for pending in self.queue {
            let (then, next) = oneshot::channel();
            let message = outcome.clone().map(|session| QueuedReplay {
                session,
                turn: ReplayTurn {
                    after: Some(after),
                    then: Some(then),
                },
            });
            after = next;
            // A receiver that gave up (timeout) drops its turn with the message
            if pending.respond_to.send(message).is_err() {
                debug!(path = %pending.route, "queued caller gave up before replay");
            }
        }
        for observer in self.observers {
            let _ = observer.send(outcome.clone());
        }
        leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_user;
    use common::Secret;
    use std::pin::Pin;
    use std::task::Poll;

    fn session(n: u32) -> RefreshedSession {
        RefreshedSession {
            access_token: Secret::new(format!("at_{n}")),
            refresh_token: Secret::new(format!("rt_{n}")),
            user: test_user(1),
        }
    }

    fn queued(admission: RequestAdmission<'_>) -> oneshot::Receiver<Result<QueuedReplay>> {
        match admission {
            RequestAdmission::Queued(rx) => rx,
            RequestAdmission::Lead(_) => panic!("expected the request to queue"),
        }
    }

    #[test]
    fn first_admission_leads_and_later_ones_queue() {
        let coordinator = RefreshCoordinator::new();
        assert!(!coordinator.is_refreshing());

        let lead = coordinator.admit_request("/a");
        assert!(matches!(lead, RequestAdmission::Lead(_)));
        assert!(coordinator.is_refreshing());

        let _second = queued(coordinator.admit_request("/b"));
        let _third = queued(coordinator.admit_request("/c"));
        assert_eq!(coordinator.queued(), 2);

        let RequestAdmission::Lead(guard) = lead else {
            unreachable!()
        };
        let settled = guard.settle();
        let paths: Vec<&str> = settled.queue.iter().map(|p| p.route.as_str()).collect();
        assert_eq!(paths, vec!["/b", "/c"]);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn dropped_leader_rejects_queue_and_resets() {
        let coordinator = RefreshCoordinator::new();
        let lead = coordinator.admit_request("/a");
        let rx = queued(coordinator.admit_request("/b"));

        drop(lead);
        assert!(!coordinator.is_refreshing());
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::RefreshAbandoned)));
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter() {
        let coordinator = RefreshCoordinator::new();
        let RefreshAdmission::Lead(guard) = coordinator.admit_refresh() else {
            panic!("idle coordinator must hand out leadership");
        };
        let RefreshAdmission::Joined(observer) = coordinator.admit_refresh() else {
            panic!("second refresh must join");
        };
        let waiter = queued(coordinator.admit_request("/x"));

        guard
            .settle()
            .deliver(&Err(Error::RefreshFailed("upstream 503".into())));

        assert!(matches!(observer.await.unwrap(), Err(Error::RefreshFailed(_))));
        assert!(matches!(waiter.await.unwrap(), Err(Error::RefreshFailed(_))));
    }

    #[tokio::test]
    async fn replay_turns_follow_enqueue_order() {
        let coordinator = RefreshCoordinator::new();
        let RequestAdmission::Lead(guard) = coordinator.admit_request("/a") else {
            panic!("must lead");
        };
        let first = queued(coordinator.admit_request("/b"));
        let second = queued(coordinator.admit_request("/c"));

        let mut leader = guard.settle().deliver(&Ok(session(2)));
        let mut first = first.await.unwrap().unwrap();
        let mut second = second.await.unwrap().unwrap();
        assert_eq!(first.session.access_token.expose(), "at_2");

        let second_started = async {
            second.turn.wait().await;
        };
        tokio::pin!(second_started);
        assert!(poll_once(&mut second_started).await.is_pending());

        leader.wait().await;
        leader.pass();
        first.turn.wait().await;
        assert!(poll_once(&mut second_started).await.is_pending());
        first.turn.pass();
        second_started.await;
    }

    #[tokio::test]
    async fn dropped_turn_frees_the_next_replay() {
        let coordinator = RefreshCoordinator::new();
        let RequestAdmission::Lead(guard) = coordinator.admit_request("/a") else {
            panic!("must lead");
        };
        let gone = queued(coordinator.admit_request("/b"));
        let next = queued(coordinator.admit_request("/c"));
        drop(gone);

        let leader = guard.settle().deliver(&Ok(session(2)));
        drop(leader);

        let mut next = next.await.unwrap().unwrap();
        next.turn.wait().await;
    }

    #[test]
    fn new_cycle_after_settle() {
        let coordinator = RefreshCoordinator::new();
        let RefreshAdmission::Lead(guard) = coordinator.admit_refresh() else {
            panic!("must lead");
        };
        let _ = guard.settle();
        assert!(matches!(
            coordinator.admit_refresh(),
            RefreshAdmission::Lead(_)
        ));
    }

    async fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        std::future::poll_fn(|cx| Poll::Ready(Pin::new(&mut *future).poll(cx))).await
    }
}
