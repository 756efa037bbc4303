//! Terminal single-slot buffer polled by the render loop.
//!
//! The slot holds the newest completed result. Writers swap it in and readers clone a
//! handle out, each inside a short critical section, so a reader never observes a
//! half-built frame and never holds the lock while rendering. The first read of each new
//! index sends `Consumed(index)` upstream to the throttle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use super::graph::Emitter;
use super::packet::{Packet, PortKind, Signal};
use super::stage::{Outbox, Stage, StageContext, StageCounters};
use crate::frame::ResultFrame;

#[derive(Default)]
struct Slot {
    latest: Option<ResultFrame>,
    last_read: Option<u64>,
}

#[derive(Default)]
struct SinkShared {
    slot: Mutex<Slot>,
    signal: OnceLock<Emitter>,
    reads: AtomicU64,
}

impl SinkShared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct BufferSink {
    shared: Arc<SinkShared>,
    counters: StageCounters,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read handle for the consumer. May be created before the graph is built.
    pub fn reader(&self) -> SinkReader {
        SinkReader {
            shared: self.shared.clone(),
        }
    }
}

impl Stage for BufferSink {
    fn kind(&self) -> &'static str {
        "buffer"
    }

    fn inputs(&self) -> Vec<PortKind> {
        vec![PortKind::Result]
    }

    fn outputs(&self) -> Vec<PortKind> {
        vec![PortKind::Signal]
    }

    fn attach(&mut self, ctx: StageContext) {
        if self.shared.signal.set(ctx.emitter).is_err() {
            log::warn!("buffer {}: already attached", ctx.name);
        }
    }

    fn receive(&mut self, _port: usize, packet: Packet, _out: &mut Outbox) {
        self.counters.received += 1;
        let Packet::Result(frame) = packet else {
            self.counters.dropped += 1;
            return;
        };

        // Whatever leaves the slot is released after the lock is dropped.
        let released = {
            let mut slot = self.shared.lock();
            match slot.latest.as_ref().map(ResultFrame::index) {
                Some(current) if frame.index() <= current => {
                    self.counters.dropped += 1;
                    Some(frame)
                }
                current => {
                    if current.is_some_and(|index| slot.last_read != Some(index)) {
                        self.counters.superseded += 1;
                    }
                    self.counters.emitted += 1;
                    slot.latest.replace(frame)
                }
            }
        };
        drop(released);
    }

    fn queue_depth(&self) -> usize {
        usize::from(self.shared.lock().latest.is_some())
    }

    fn counters(&self) -> StageCounters {
        self.counters
    }

    fn teardown(&mut self) {
        let released = self.shared.lock().latest.take();
        drop(released);
    }
}

/// Consumer handle on the buffer sink. Cheap to clone, safe to use from any thread.
#[derive(Clone)]
pub struct SinkReader {
    shared: Arc<SinkShared>,
}

impl SinkReader {
    /// Newest completed result, if any. Never blocks on the pipeline.
    pub fn peek(&self) -> Option<ResultFrame> {
        let (frame, fresh) = {
            let mut slot = self.shared.lock();
            let latest = slot.latest.as_ref()?;
            let index = latest.index();
            let fresh = slot.last_read != Some(index);
            let frame = latest.share();
            if fresh {
                slot.last_read = Some(index);
            }
            (frame, fresh)
        };
        self.shared.reads.fetch_add(1, Ordering::Relaxed);

        if fresh {
            if let Some(signal) = self.shared.signal.get() {
                signal.emit(0, Packet::Signal(Signal::Consumed(frame.index())));
            }
        }
        Some(frame)
    }

    /// Index of the frame currently held, without marking it consumed.
    pub fn latest_index(&self) -> Option<u64> {
        self.shared.lock().latest.as_ref().map(ResultFrame::index)
    }

    pub fn reads(&self) -> u64 {
        self.shared.reads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::{make_counted_frame, make_frame};
    use crate::frame::ResultSlot;
    use crate::pipeline::graph::GraphBuilder;
    use crate::pipeline::throttle::{OverflowPolicy, Throttle, SIGNAL_PORT};
    use crate::pipeline::CaptureToResult;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn result(index: u64) -> Packet {
        Packet::Result(ResultFrame::complete(make_frame(index), vec![ResultSlot::Empty]))
    }

    #[test]
    fn keeps_only_the_newest_frame() {
        let mut sink = BufferSink::new();
        let reader = sink.reader();
        let mut out = Outbox::new();
        assert!(reader.peek().is_none());

        sink.receive(0, result(2), &mut out);
        sink.receive(0, result(1), &mut out);
        assert_eq!(reader.latest_index(), Some(2));
        assert_eq!(sink.counters().dropped, 1);

        sink.receive(0, result(3), &mut out);
        assert_eq!(sink.counters().superseded, 1);
        assert_eq!(reader.peek().map(|frame| frame.index()), Some(3));
        assert!(out.is_empty());
    }

    #[test]
    fn teardown_releases_held_frame() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut sink = BufferSink::new();
        let reader = sink.reader();
        let frame = ResultFrame::complete(make_counted_frame(1, releases.clone()), vec![]);
        sink.receive(0, Packet::Result(frame), &mut Outbox::new());

        let held = reader.peek();
        sink.teardown();
        assert_eq!(releases.load(Ordering::SeqCst), 0, "reader still holds it");
        drop(held);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(reader.peek().is_none());
    }

    #[test]
    fn first_read_of_each_index_signals_consumed() {
        let mut builder = GraphBuilder::new();
        let throttle = builder.add_stage("throttle", Throttle::new(1, OverflowPolicy::KeepNewest));
        let wrap = builder.add_stage("wrap", CaptureToResult::new());
        let sink = BufferSink::new();
        let reader = sink.reader();
        let sink = builder.add_stage("sink", sink);
        builder
            .expose_input(throttle, 0)
            .connect(throttle, 0, wrap, 0)
            .connect(wrap, 0, sink, 0)
            .connect(sink, 0, throttle, SIGNAL_PORT);
        let graph = builder.build().unwrap();
        graph.start().unwrap();
        let inlet = graph.inlet(throttle, 0).unwrap();

        inlet.push(make_frame(1));
        inlet.push(make_frame(2));
        inlet.push(make_frame(3));
        assert_eq!(reader.latest_index(), Some(1));

        // Reading 1 frees the throttle, which admits pending frame 3.
        assert_eq!(reader.peek().map(|frame| frame.index()), Some(1));
        assert_eq!(reader.latest_index(), Some(3));
        assert_eq!(reader.peek().map(|frame| frame.index()), Some(3));
        // A repeated read of the same index sends nothing.
        assert_eq!(reader.peek().map(|frame| frame.index()), Some(3));
        inlet.push(make_frame(4));
        assert_eq!(reader.latest_index(), Some(4));
        assert_eq!(reader.reads(), 3);
    }

    #[test]
    fn concurrent_reader_never_sees_torn_or_older_frame() {
        let mut sink = BufferSink::new();
        let reader = sink.reader();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let observer = {
            let reader = reader.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                while !done.load(Ordering::SeqCst) {
                    if let Some(frame) = reader.peek() {
                        assert!(frame.index() >= last);
                        let expected = frame.index() as u8;
                        assert!(frame.input().pixels().bytes().iter().all(|&b| b == expected));
                        last = frame.index();
                    }
                }
                last
            })
        };

        let mut out = Outbox::new();
        for index in 1..=5_000 {
            sink.receive(0, result(index), &mut out);
            if index % 1_000 == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        done.store(true, Ordering::SeqCst);
        let last = observer.join().unwrap();
        assert!(last <= 5_000);
        assert_eq!(reader.latest_index(), Some(5_000));
    }
}
