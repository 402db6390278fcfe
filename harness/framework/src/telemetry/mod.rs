// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asserting on device telemetry.
//!
//! A [`TelemetryBus`] owns at most one reader task per (device, telemetry
//! class). The task pulls messages off the controller stream and offers each
//! one, in arrival order, to every active handler registered on that stream.
//!
//! Handlers are grouped into [`AssertionSession`]s. A session succeeds once
//! every one of its success handlers has matched, and fails fast as soon as
//! any of its must-not-happen handlers matches. Each handler matches at most
//! once; after that it is dropped from its stream.
//!
//! Subscriptions are shared. The first session to register a handler on a
//! stream starts the reader task; the task stops when the last session using
//! the stream is dropped, or when the bus is shut down.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edge_api_types::telemetry::{Telemetry, TelemetryClass};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::controller::{ControllerError, TelemetryStreams};

pub mod checks;

/// A condition evaluated against each message on a stream.
pub trait Predicate: Send + 'static {
    fn evaluate(&mut self, msg: &Telemetry) -> bool;
}

impl<F> Predicate for F
where
    F: FnMut(&Telemetry) -> bool + Send + 'static,
{
    fn evaluate(&mut self, msg: &Telemetry) -> bool {
        self(msg)
    }
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every success handler matched, or the deadline passed for a session
    /// with only must-not-happen handlers.
    Success,
    /// A must-not-happen handler matched.
    FailFast { handler: String },
    /// The deadline passed with success handlers still unmatched.
    Timeout { pending: Vec<String> },
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Success,
    MustNotHappen,
}

const ACTIVE: u8 = 0;
const TRIGGERED: u8 = 1;
const DISABLED: u8 = 2;

type StreamKey = (Uuid, TelemetryClass);

struct Handler {
    session: u64,
    index: usize,
    state: AtomicU8,
    predicate: Mutex<Box<dyn Predicate>>,
    triggered: mpsc::UnboundedSender<usize>,
    cancel: CancellationToken,
}

impl Handler {
    /// Offers `msg` to this handler. Returns whether the handler is done and
    /// should leave its stream.
    fn offer(&self, msg: &Telemetry) -> bool {
        if self.state.load(Ordering::Acquire) != ACTIVE {
            return true;
        }
        if self.cancel.is_cancelled() {
            self.disable();
            return true;
        }

        if !self.predicate.lock().unwrap().evaluate(msg) {
            return false;
        }

        if self
            .state
            .compare_exchange(ACTIVE, TRIGGERED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && !self.cancel.is_cancelled()
        {
            // The session may already have finished waiting.
            let _ = self.triggered.send(self.index);
        }
        true
    }

    fn disable(&self) {
        let _ = self.state.compare_exchange(
            ACTIVE,
            DISABLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

type HandlerList = Arc<Mutex<Vec<Arc<Handler>>>>;

struct Subscription {
    handlers: HandlerList,
    sessions: usize,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct BusInner {
    streams: Arc<dyn TelemetryStreams>,
    subscriptions: Mutex<BTreeMap<StreamKey, Subscription>>,
    cancel: CancellationToken,
    next_session: AtomicU64,
}

/// Fans device telemetry out to assertion handlers.
#[derive(Clone)]
pub struct TelemetryBus {
    inner: Arc<BusInner>,
}

impl TelemetryBus {
    pub fn new(streams: Arc<dyn TelemetryStreams>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                streams,
                subscriptions: Mutex::new(BTreeMap::new()),
                cancel: CancellationToken::new(),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a new, empty session.
    pub fn session(&self) -> AssertionSession {
        let (tx, rx) = mpsc::unbounded_channel();
        AssertionSession {
            bus: self.clone(),
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            cancel: self.inner.cancel.child_token(),
            handlers: Vec::new(),
            streams: BTreeSet::new(),
            tx,
            rx,
        }
    }

    /// The number of streams that currently have a reader task.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().unwrap().len()
    }

    /// Cancels every session and stops every reader task.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let subscriptions = std::mem::take(
            &mut *self.inner.subscriptions.lock().unwrap(),
        );
        for ((device, class), sub) in subscriptions {
            if let Err(e) = sub.task.await {
                warn!(%device, %class, error = %e, "telemetry reader failed");
            }
        }
        info!("telemetry bus shut down");
    }

    /// Adds `handler` to the stream `key`, starting a reader if there is none.
    /// `first_use` says whether this is the session's first handler on the
    /// stream, in which case the session is counted as a user of it.
    fn attach(&self, key: StreamKey, handler: Arc<Handler>, first_use: bool) {
        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        let sub = subscriptions.entry(key).or_insert_with(|| self.subscribe(key));
        if first_use {
            sub.sessions += 1;
        }
        sub.handlers.lock().unwrap().push(handler);
    }

    fn subscribe(&self, (device, class): StreamKey) -> Subscription {
        let handlers: HandlerList = Arc::default();
        let cancel = self.inner.cancel.child_token();
        let task = tokio::spawn(
            read_stream(
                self.inner.streams.clone(),
                device,
                class,
                handlers.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("telemetry", %device, %class)),
        );
        debug!(%device, %class, "subscribed to telemetry");

        Subscription { handlers, sessions: 0, cancel, task }
    }

    /// Drops session `session`'s handlers from stream `key`, stopping the
    /// reader if no other session is using it.
    fn detach(&self, key: StreamKey, session: u64) {
        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        let Some(sub) = subscriptions.get_mut(&key) else {
            return;
        };

        sub.handlers.lock().unwrap().retain(|h| h.session != session);
        sub.sessions = sub.sessions.saturating_sub(1);
        if sub.sessions == 0 {
            if let Some(sub) = subscriptions.remove(&key) {
                sub.cancel.cancel();
                debug!(device = %key.0, class = %key.1, "unsubscribed from telemetry");
            }
        }
    }
}

async fn read_stream(
    streams: Arc<dyn TelemetryStreams>,
    device: Uuid,
    class: TelemetryClass,
    handlers: HandlerList,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = streams.next(device, class) => next,
        };

        match next {
            Ok(msg) => dispatch(&handlers, &msg),
            Err(ControllerError::StreamClosed { .. }) => {
                debug!("telemetry stream ended");
                break;
            }
            Err(e) => {
                warn!(error = %e, "telemetry stream failed");
                break;
            }
        }
    }
}

fn dispatch(handlers: &HandlerList, msg: &Telemetry) {
    // Evaluate against a snapshot so predicates never run under the list lock.
    let snapshot = handlers.lock().unwrap().clone();

    let done: Vec<_> = snapshot.into_iter().filter(|h| h.offer(msg)).collect();
    if !done.is_empty() {
        handlers
            .lock()
            .unwrap()
            .retain(|h| !done.iter().any(|d| Arc::ptr_eq(h, d)));
    }
}

struct Registered {
    name: String,
    role: Role,
    handler: Arc<Handler>,
}

/// A group of handlers that succeed or fail together.
///
/// Dropping a session disables its handlers and releases its streams.
pub struct AssertionSession {
    bus: TelemetryBus,
    id: u64,
    cancel: CancellationToken,
    handlers: Vec<Registered>,
    streams: BTreeSet<StreamKey>,
    tx: mpsc::UnboundedSender<usize>,
    rx: mpsc::UnboundedReceiver<usize>,
}

impl AssertionSession {
    /// Registers a handler that must match before the session can succeed.
    pub fn register_success(
        &mut self,
        device: Uuid,
        class: TelemetryClass,
        name: &str,
        predicate: impl Predicate,
    ) -> &mut Self {
        self.register(device, class, name, Role::Success, Box::new(predicate))
    }

    /// Registers a handler that fails the session if it ever matches.
    pub fn register_must_not_happen(
        &mut self,
        device: Uuid,
        class: TelemetryClass,
        name: &str,
        predicate: impl Predicate,
    ) -> &mut Self {
        self.register(
            device,
            class,
            name,
            Role::MustNotHappen,
            Box::new(predicate),
        )
    }

    fn register(
        &mut self,
        device: Uuid,
        class: TelemetryClass,
        name: &str,
        role: Role,
        predicate: Box<dyn Predicate>,
    ) -> &mut Self {
        let handler = Arc::new(Handler {
            session: self.id,
            index: self.handlers.len(),
            state: AtomicU8::new(ACTIVE),
            predicate: Mutex::new(predicate),
            triggered: self.tx.clone(),
            cancel: self.cancel.clone(),
        });
        let first_use = self.streams.insert((device, class));
        self.bus.attach((device, class), handler.clone(), first_use);
        self.handlers.push(Registered { name: name.to_owned(), role, handler });
        self
    }

    /// A token that cancels this session's wait when cancelled.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the session to resolve, giving up after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Outcome {
        let deadline = Instant::now() + timeout;
        let expected =
            self.handlers.iter().filter(|h| h.role == Role::Success).count();
        let mut matched = vec![false; self.handlers.len()];
        let mut remaining = expected;

        let outcome = loop {
            if expected > 0 && remaining == 0 {
                break Outcome::Success;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Outcome::Cancelled,
                Some(index) = self.rx.recv() => {
                    let h = &self.handlers[index];
                    match h.role {
                        Role::MustNotHappen => {
                            break Outcome::FailFast { handler: h.name.clone() };
                        }
                        Role::Success => {
                            if !std::mem::replace(&mut matched[index], true) {
                                debug!(handler = h.name, "handler matched");
                                remaining -= 1;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break if expected == 0 {
                        Outcome::Success
                    } else {
                        Outcome::Timeout {
                            pending: self
                                .handlers
                                .iter()
                                .zip(&matched)
                                .filter(|(h, m)| h.role == Role::Success && !**m)
                                .map(|(h, _)| h.name.clone())
                                .collect(),
                        }
                    };
                }
            }
        };

        match &outcome {
            Outcome::Success => info!(session = self.id, "assertions met"),
            other => warn!(session = self.id, outcome = ?other, "assertions failed"),
        }
        outcome
    }
}

impl Drop for AssertionSession {
    fn drop(&mut self) {
        for h in &self.handlers {
            h.handler.disable();
        }
        for key in std::mem::take(&mut self.streams) {
            self.bus.detach(key, self.id);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::checks;
    use super::*;
    use crate::controller::MockController;
    use chrono::Utc;
    use edge_api_types::telemetry::{AppRunState, InfoMsg, InfoPayload};

    fn app(device: Uuid, name: &str, state: AppRunState) -> Telemetry {
        Telemetry::Info(InfoMsg {
            device_id: device,
            at_time: Utc::now(),
            payload: InfoPayload::App {
                id: format!("{name}-id"),
                name: name.to_owned(),
                state,
                errors: Vec::new(),
            },
        })
    }

    fn setup() -> (Arc<MockController>, TelemetryBus, Uuid) {
        let ctl = Arc::new(MockController::new());
        let bus = TelemetryBus::new(ctl.clone());
        (ctl, bus, Uuid::new_v4())
    }

    #[tokio::test]
    async fn every_success_handler_must_match() {
        let (ctl, bus, dev) = setup();
        let mut session = bus.session();
        session
            .register_success(
                dev,
                TelemetryClass::Info,
                "a running",
                checks::app_state("a", AppRunState::Running),
            )
            .register_success(
                dev,
                TelemetryClass::Info,
                "b running",
                checks::app_state("b", AppRunState::Running),
            );

        ctl.publish(dev, app(dev, "a", AppRunState::Running));
        ctl.publish(dev, app(dev, "b", AppRunState::Booting));
        ctl.publish(dev, app(dev, "b", AppRunState::Running));

        assert_eq!(session.wait(Duration::from_secs(10)).await, Outcome::Success);
    }

    #[tokio::test]
    async fn must_not_happen_fails_fast() {
        let (ctl, bus, dev) = setup();
        let mut session = bus.session();
        session
            .register_success(
                dev,
                TelemetryClass::Info,
                "a running",
                checks::app_state("a", AppRunState::Running),
            )
            .register_must_not_happen(
                dev,
                TelemetryClass::Info,
                "a failed",
                checks::app_state("a", AppRunState::Error),
            );

        ctl.publish(dev, app(dev, "a", AppRunState::Booting));
        ctl.publish(dev, app(dev, "a", AppRunState::Error));
        ctl.publish(dev, app(dev, "a", AppRunState::Running));

        assert_eq!(
            session.wait(Duration::from_secs(10)).await,
            Outcome::FailFast { handler: "a failed".into() }
        );
    }

    #[tokio::test]
    async fn handlers_match_at_most_once() {
        let (ctl, bus, dev) = setup();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));

        let mut session = bus.session();
        let evals = evaluations.clone();
        let count = seen.clone();
        session
            .register_success(dev, TelemetryClass::Info, "any", move |_: &Telemetry| {
                evals.fetch_add(1, Ordering::SeqCst);
                true
            })
            .register_success(dev, TelemetryClass::Info, "tenth", move |_: &Telemetry| {
                count.fetch_add(1, Ordering::SeqCst) + 1 == 10
            });

        for _ in 0..10 {
            ctl.publish(dev, app(dev, "a", AppRunState::Running));
        }

        assert_eq!(session.wait(Duration::from_secs(10)).await, Outcome::Success);
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_handlers_time_out() {
        let (ctl, bus, dev) = setup();
        let mut session = bus.session();
        session
            .register_success(
                dev,
                TelemetryClass::Info,
                "a running",
                checks::app_state("a", AppRunState::Running),
            )
            .register_success(
                dev,
                TelemetryClass::Info,
                "b running",
                checks::app_state("b", AppRunState::Running),
            );
        ctl.publish(dev, app(dev, "a", AppRunState::Running));

        let start = Instant::now();
        let outcome = session.wait(Duration::from_secs(2)).await;
        assert_eq!(outcome, Outcome::Timeout { pending: vec!["b running".into()] });
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_sessions_succeed_at_the_deadline() {
        let (ctl, bus, dev) = setup();
        let mut session = bus.session();
        session.register_must_not_happen(
            dev,
            TelemetryClass::Info,
            "a failed",
            checks::app_state("a", AppRunState::Error),
        );
        ctl.publish(dev, app(dev, "a", AppRunState::Running));

        assert_eq!(session.wait(Duration::from_secs(2)).await, Outcome::Success);
    }

    #[tokio::test]
    async fn subscriptions_are_shared_and_released() {
        let (ctl, bus, dev) = setup();

        let mut first = bus.session();
        first.register_success(
            dev,
            TelemetryClass::Info,
            "a running",
            checks::app_state("a", AppRunState::Running),
        );
        let mut second = bus.session();
        second
            .register_success(
                dev,
                TelemetryClass::Info,
                "a running",
                checks::app_state("a", AppRunState::Running),
            )
            .register_success(
                dev,
                TelemetryClass::Log,
                "hello",
                checks::log_matches("hello").unwrap(),
            );
        assert_eq!(bus.active_subscriptions(), 2);

        // Both sessions observe the same message.
        ctl.publish(dev, app(dev, "a", AppRunState::Running));
        assert_eq!(first.wait(Duration::from_secs(10)).await, Outcome::Success);
        assert_eq!(bus.active_subscriptions(), 2);

        let cancel = second.cancel_handle();
        cancel.cancel();
        assert_eq!(second.wait(Duration::from_secs(10)).await, Outcome::Cancelled);
        assert_eq!(bus.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_streams_end_without_a_match() {
        let (ctl, bus, dev) = setup();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let evals = evaluations.clone();
        let mut running = checks::app_state("a", AppRunState::Running);

        let mut session = bus.session();
        session
            .register_success(dev, TelemetryClass::Info, "a running", move |msg: &Telemetry| {
                evals.fetch_add(1, Ordering::SeqCst);
                running.evaluate(msg)
            })
            .register_must_not_happen(
                dev,
                TelemetryClass::Info,
                "a failed",
                checks::app_state("a", AppRunState::Error),
            );

        ctl.publish(dev, app(dev, "a", AppRunState::Booting));
        ctl.close(dev, TelemetryClass::Info);
        ctl.publish(dev, app(dev, "a", AppRunState::Running));

        assert_eq!(
            session.wait(Duration::from_secs(5)).await,
            Outcome::Timeout { pending: vec!["a running".into()] }
        );
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_sessions_ignore_later_matches() {
        let (ctl, bus, dev) = setup();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let (ok, bad) = (evaluations.clone(), evaluations.clone());

        let mut session = bus.session();
        session
            .register_success(dev, TelemetryClass::Info, "anything", move |_: &Telemetry| {
                ok.fetch_add(1, Ordering::SeqCst);
                true
            })
            .register_must_not_happen(dev, TelemetryClass::Info, "also anything", move |_: &Telemetry| {
                bad.fetch_add(1, Ordering::SeqCst);
                true
            });

        session.cancel_handle().cancel();
        ctl.publish(dev, app(dev, "a", AppRunState::Error));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(evaluations.load(Ordering::SeqCst), 0);
        assert_eq!(session.wait(Duration::from_secs(5)).await, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_sessions() {
        let (_ctl, bus, dev) = setup();
        let mut session = bus.session();
        session.register_success(
            dev,
            TelemetryClass::Metric,
            "never",
            |_: &Telemetry| false,
        );

        let waiter = tokio::spawn(session.wait(Duration::from_secs(60)));
        bus.shutdown().await;
        assert_eq!(waiter.await.unwrap(), Outcome::Cancelled);
        assert_eq!(bus.active_subscriptions(), 0);
    }
}
