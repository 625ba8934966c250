//! Single-slot request mailbox between caller threads and the engine thread.
//!
//! Two gates:
//! - the **request gate** holds at most one pending request. The engine thread parks on it
//!   while paused and uses it for its short backoff waits, so a new request always wakes it.
//! - the **reply gate** carries the outcome of the last serviced request, tagged with the
//!   request's ticket so a caller that timed out can never pick up someone else's reply.
//!
//! A request keeps the slot busy from deposit until its submitter has read the outcome (or
//! given up), so the single reply slot is never overwritten before it was consumed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::source::SourceRef;

pub(crate) enum Action {
    Play,
    Pause,
    Resume,
    Seek { ms: u64 },
    SetNext { next: Option<SourceRef> },
    Reset,
}

impl Action {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Action::Play => "play",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Seek { .. } => "seek",
            Action::SetNext { .. } => "set_next",
            Action::Reset => "reset",
        }
    }
}

pub(crate) struct Request {
    pub(crate) ticket: u64,
    pub(crate) action: Action,
    pub(crate) requester: SourceRef,
}

#[derive(Default)]
struct RequestSlot {
    pending: Option<Request>,
    /// Ticket whose submitter has not consumed its outcome yet.
    in_flight: Option<u64>,
    next_ticket: u64,
}

impl RequestSlot {
    fn is_busy(&self) -> bool {
        self.pending.is_some() || self.in_flight.is_some()
    }
}

#[derive(Default)]
struct ReplySlot {
    ticket: u64,
    outcome: Option<Result<()>>,
}

pub(crate) struct Mailbox {
    alive: Arc<AtomicBool>,
    request: Mutex<RequestSlot>,
    request_cv: Condvar,
    reply: Mutex<ReplySlot>,
    reply_cv: Condvar,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Mailbox {
    pub(crate) fn new(alive: Arc<AtomicBool>) -> Self {
        Self {
            alive,
            request: Mutex::new(RequestSlot::default()),
            request_cv: Condvar::new(),
            reply: Mutex::new(ReplySlot::default()),
            reply_cv: Condvar::new(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Hand `action` to the engine thread and wait for its outcome.
    ///
    /// Waits first for the slot to be free, then for the reply, both bounded by `timeout`.
    pub(crate) fn submit(
        &self,
        action: Action,
        requester: SourceRef,
        timeout: Duration,
    ) -> Result<()> {
        if !self.is_alive() {
            return Err(EngineError::NotRunning);
        }
        let deadline = Instant::now() + timeout;
        let name = action.name();

        let ticket = {
            let mut slot = lock(&self.request);
            while slot.is_busy() && self.is_alive() {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    tracing::warn!(action = name, "request slot still busy, giving up");
                    return Err(EngineError::Timeout);
                }
                slot = self
                    .request_cv
                    .wait_timeout(slot, left)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            if !self.is_alive() {
                return Err(EngineError::NotRunning);
            }
            slot.next_ticket += 1;
            let ticket = slot.next_ticket;
            slot.pending = Some(Request {
                ticket,
                action,
                requester,
            });
            slot.in_flight = Some(ticket);
            self.request_cv.notify_all();
            ticket
        };

        let outcome = self.await_reply(ticket, name, deadline);
        self.finish(ticket);
        outcome
    }

    fn await_reply(&self, ticket: u64, name: &'static str, deadline: Instant) -> Result<()> {
        let mut reply = lock(&self.reply);
        loop {
            if reply.ticket == ticket {
                if let Some(outcome) = reply.outcome.take() {
                    return outcome;
                }
            }
            if !self.is_alive() {
                return Err(EngineError::NotRunning);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                tracing::warn!(action = name, ticket, "engine did not answer in time");
                return Err(EngineError::Timeout);
            }
            reply = self
                .reply_cv
                .wait_timeout(reply, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Free the slot for the next submitter once `ticket` is done with.
    fn finish(&self, ticket: u64) {
        let mut slot = lock(&self.request);
        if slot.in_flight == Some(ticket) {
            slot.in_flight = None;
            self.request_cv.notify_all();
        }
    }

    /// Take the pending request without waiting.
    pub(crate) fn try_take(&self) -> Option<Request> {
        lock(&self.request).pending.take()
    }

    /// Park the engine thread until a request arrives or the engine is torn down.
    pub(crate) fn wait_for_request(&self) -> Option<Request> {
        let mut slot = lock(&self.request);
        while slot.pending.is_none() && self.is_alive() {
            slot = self
                .request_cv
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if !self.is_alive() {
            return None;
        }
        slot.pending.take()
    }

    /// Sleep for up to `timeout`, returning early when a request arrives or on teardown.
    pub(crate) fn backoff(&self, timeout: Duration) {
        let slot = lock(&self.request);
        if slot.pending.is_some() || !self.is_alive() {
            return;
        }
        let _ = self
            .request_cv
            .wait_timeout_while(slot, timeout, |s| s.pending.is_none() && self.is_alive())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Publish the outcome of the request with `ticket`.
    pub(crate) fn reply(&self, ticket: u64, outcome: Result<()>) {
        let mut reply = lock(&self.reply);
        reply.ticket = ticket;
        reply.outcome = Some(outcome);
        self.reply_cv.notify_all();
    }

    /// Mark the engine dead and wake everyone parked on either gate.
    pub(crate) fn shut_down(&self) {
        self.alive.store(false, Ordering::Release);
        {
            let _slot = lock(&self.request);
            self.request_cv.notify_all();
        }
        let _reply = lock(&self.reply);
        self.reply_cv.notify_all();
    }

    /// Answer a request that was deposited but never serviced.
    pub(crate) fn reject_pending(&self) {
        let request = lock(&self.request).pending.take();
        if let Some(request) = request {
            self.reply(request.ticket, Err(EngineError::NotRunning));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSource;
    use std::thread;

    fn mailbox() -> Arc<Mailbox> {
        Arc::new(Mailbox::new(Arc::new(AtomicBool::new(true))))
    }

    #[test]
    fn submit_returns_engine_outcome() {
        let mb = mailbox();
        let engine = mb.clone();
        let worker = thread::spawn(move || {
            let request = engine.wait_for_request().unwrap();
            assert_eq!(request.action.name(), "pause");
            engine.reply(request.ticket, Err(EngineError::IllegalState("not current")));
        });

        let out = mb.submit(
            Action::Pause,
            MockSource::builder().build(),
            Duration::from_secs(5),
        );
        assert!(matches!(out, Err(EngineError::IllegalState(_))));
        worker.join().unwrap();
    }

    #[test]
    fn submit_times_out_when_nobody_answers() {
        let mb = mailbox();
        let out = mb.submit(
            Action::Play,
            MockSource::builder().build(),
            Duration::from_millis(20),
        );
        assert!(matches!(out, Err(EngineError::Timeout)));
        // The request stays in the slot until the engine takes it.
        assert!(mb.try_take().is_some());
    }

    #[test]
    fn late_reply_is_not_picked_up_by_next_request() {
        let mb = mailbox();
        let first = mb.submit(
            Action::Play,
            MockSource::builder().build(),
            Duration::from_millis(10),
        );
        assert!(matches!(first, Err(EngineError::Timeout)));
        let stale = mb.try_take().unwrap();
        mb.reply(stale.ticket, Ok(()));

        let engine = mb.clone();
        let worker = thread::spawn(move || {
            let request = engine.wait_for_request().unwrap();
            engine.reply(request.ticket, Err(EngineError::IllegalState("second")));
        });
        let second = mb.submit(
            Action::Reset,
            MockSource::builder().build(),
            Duration::from_secs(5),
        );
        assert!(matches!(second, Err(EngineError::IllegalState("second"))));
        worker.join().unwrap();
    }

    #[test]
    fn concurrent_submitters_each_get_their_own_reply() {
        let mb = mailbox();
        let engine = mb.clone();
        let worker = thread::spawn(move || {
            let mut serviced = 0;
            while let Some(request) = engine.wait_for_request() {
                engine.reply(request.ticket, Ok(()));
                serviced += 1;
            }
            serviced
        });

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let mb = mb.clone();
                thread::spawn(move || {
                    let source: SourceRef = MockSource::builder().build();
                    (0..200)
                        .filter(|_| {
                            mb.submit(Action::Reset, source.clone(), Duration::from_millis(500))
                                .is_err()
                        })
                        .count()
                })
            })
            .collect();
        let failures: usize = callers.into_iter().map(|c| c.join().unwrap()).sum();

        mb.shut_down();
        assert_eq!(worker.join().unwrap(), 800);
        assert_eq!(failures, 0);
    }

    #[test]
    fn slot_stays_busy_until_reply_is_read() {
        let mb = mailbox();
        let caller = mb.clone();
        let first = thread::spawn(move || {
            caller.submit(Action::Play, MockSource::builder().build(), Duration::from_secs(5))
        });
        let request = loop {
            if let Some(request) = mb.try_take() {
                break request;
            }
            thread::sleep(Duration::from_millis(1));
        };

        // Taken but not answered: a second submitter has to wait for the first to finish.
        let busy = mb.submit(
            Action::Reset,
            MockSource::builder().build(),
            Duration::from_millis(20),
        );
        assert!(matches!(busy, Err(EngineError::Timeout)));
        assert!(mb.try_take().is_none());

        mb.reply(request.ticket, Ok(()));
        assert!(first.join().unwrap().is_ok());
    }

    #[test]
    fn shutdown_wakes_parked_engine_and_rejects_new_requests() {
        let mb = mailbox();
        let engine = mb.clone();
        let worker = thread::spawn(move || engine.wait_for_request().is_none());
        thread::sleep(Duration::from_millis(10));
        mb.shut_down();
        assert!(worker.join().unwrap());

        let out = mb.submit(
            Action::Resume,
            MockSource::builder().build(),
            Duration::from_secs(1),
        );
        assert!(matches!(out, Err(EngineError::NotRunning)));
    }

    #[test]
    fn backoff_returns_early_on_request() {
        let mb = mailbox();
        let caller = mb.clone();
        let submitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let _ = caller.submit(
                Action::Resume,
                MockSource::builder().build(),
                Duration::from_millis(200),
            );
        });
        let start = Instant::now();
        mb.backoff(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(5));
        let request = mb.try_take().unwrap();
        mb.reply(request.ticket, Ok(()));
        submitter.join().unwrap();
    }
}
