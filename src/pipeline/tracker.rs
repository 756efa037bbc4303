//! Stage wrapping a tracker backend.
//!
//! The backend runs on a worker thread owned by this stage. `receive` only swaps the
//! incoming frame into a single-slot mailbox and returns. If the worker is still busy
//! with an older frame, the previous occupant of the mailbox is displaced and announced
//! downstream as a dropped result, so the join never waits for a frame the tracker will
//! never see. A frame older than the one already pending or being tracked is announced
//! as dropped straight away instead.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use super::graph::Emitter;
use super::packet::{Packet, PortKind};
use super::stage::{Outbox, Stage, StageContext, StageCounters};
use crate::frame::{FeedbackFrame, ResultFrame, ResultSlot};
use crate::track::TrackerBackend;

#[derive(Default)]
struct MailboxState {
    pending: Option<FeedbackFrame>,
    busy: bool,
    /// Index of the frame the worker took last.
    taken: Option<u64>,
    shutdown: bool,
}

#[derive(Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
    wake: Condvar,
}

impl Mailbox {
    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TrackerStage {
    name: String,
    mailbox: Arc<Mailbox>,
    backend: Option<Box<dyn TrackerBackend>>,
    worker: Option<JoinHandle<Box<dyn TrackerBackend>>>,
    counters: StageCounters,
}

impl TrackerStage {
    /// The backend must already be started; the stage stops it on teardown.
    pub fn new(backend: Box<dyn TrackerBackend>) -> Self {
        Self {
            name: backend.name().to_string(),
            mailbox: Arc::new(Mailbox::default()),
            backend: Some(backend),
            worker: None,
            counters: StageCounters::default(),
        }
    }

    pub fn tracker_name(&self) -> &str {
        &self.name
    }
}

impl Stage for TrackerStage {
    fn kind(&self) -> &'static str {
        "tracker"
    }

    fn inputs(&self) -> Vec<PortKind> {
        vec![PortKind::Feedback]
    }

    fn outputs(&self) -> Vec<PortKind> {
        vec![PortKind::Result]
    }

    fn attach(&mut self, ctx: StageContext) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let mailbox = self.mailbox.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tracker-{}", ctx.name))
            .spawn(move || run_worker(backend, mailbox, ctx.emitter));
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(err) => log::error!("tracker {}: failed to spawn worker: {}", self.name, err),
        }
    }

    fn receive(&mut self, _port: usize, packet: Packet, out: &mut Outbox) {
        self.counters.received += 1;
        let Packet::Feedback(frame) = packet else {
            self.counters.dropped += 1;
            return;
        };
        let displaced = {
            let mut state = self.mailbox.lock();
            let newest = state
                .pending
                .as_ref()
                .map(FeedbackFrame::index)
                .max(state.taken.filter(|_| state.busy));
            if newest.is_some_and(|newest| frame.index() <= newest) {
                Some(frame)
            } else {
                let displaced = state.pending.replace(frame);
                self.mailbox.wake.notify_one();
                displaced
            }
        };
        if let Some(old) = displaced {
            log::trace!("tracker {}: frame {} coalesced", self.name, old.index());
            self.counters.dropped += 1;
            out.push(0, Packet::Result(ResultFrame::dropped(old.into_input())));
        }
    }

    fn queue_depth(&self) -> usize {
        let state = self.mailbox.lock();
        usize::from(state.pending.is_some()) + usize::from(state.busy)
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }

    fn teardown(&mut self) {
        let pending = {
            let mut state = self.mailbox.lock();
            state.shutdown = true;
            self.mailbox.wake.notify_all();
            state.pending.take()
        };
        drop(pending);

        let backend = match self.worker.take() {
            Some(handle) => match handle.join() {
                Ok(backend) => Some(backend),
                Err(_) => {
                    log::error!("tracker {}: worker panicked", self.name);
                    None
                }
            },
            None => self.backend.take(),
        };
        if let Some(mut backend) = backend {
            backend.stop();
        }
    }
}

impl Drop for TrackerStage {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn run_worker(
    mut backend: Box<dyn TrackerBackend>,
    mailbox: Arc<Mailbox>,
    emitter: Emitter,
) -> Box<dyn TrackerBackend> {
    loop {
        let frame = {
            let mut state = mailbox.lock();
            loop {
                if state.shutdown {
                    return backend;
                }
                if let Some(frame) = state.pending.take() {
                    state.busy = true;
                    state.taken = Some(frame.index());
                    break frame;
                }
                state = mailbox
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let index = frame.index();
        let result = match backend.track(&frame) {
            Ok(Some(result)) => ResultFrame::pending(frame.into_input(), vec![ResultSlot::Tracked(result)]),
            Ok(None) => ResultFrame::pending(frame.into_input(), vec![ResultSlot::Empty]),
            Err(err) => {
                log::warn!("tracker {}: frame {} failed: {}", backend.name(), index, err);
                ResultFrame::dropped(frame.into_input())
            }
        };
        if !emitter.emit(0, Packet::Result(result)) {
            log::debug!("tracker {}: result for frame {} discarded", backend.name(), index);
        }

        mailbox.lock().busy = false;
    }
}
