//! Frame fan-out with per-subscriber backpressure.
//!
//! One producer (the capture loop) feeds any number of asynchronous
//! subscribers (face detection, the recorder, preview observers). Each
//! subscriber owns a bounded mailbox; when it cannot keep up, the oldest
//! pending frame is discarded so the newest always wins. Frames are never
//! duplicated and the producer never blocks on a slow subscriber.
//!
//! The synchronous consumer (the effects pipeline) is not a subscriber:
//! `ingest` returns the freshly tagged `Arc<Frame>` and the capture loop
//! applies the pipeline to that same buffer, so the real-time path carries
//! no extra copy and no queue.
//!
//! Every frame gets a monotonically increasing sequence number at ingest.
//! Subscribers observe drops as gaps in the sequence; gaps are documented
//! degradation, not errors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::frame::{CapturedFrame, Frame, SharedFrame};

/// Default mailbox depth: one pending frame, latest wins.
pub const DEFAULT_MAILBOX_DEPTH: usize = 1;

struct MailboxState {
    pending: VecDeque<SharedFrame>,
    closed: bool,
    dropped: u64,
    last_delivered_seq: Option<u64>,
}

struct Mailbox {
    label: String,
    depth: usize,
    state: Mutex<MailboxState>,
    available: Condvar,
}

impl Mailbox {
    fn push(&self, frame: SharedFrame) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        while state.pending.len() >= self.depth {
            state.pending.pop_front();
            state.dropped += 1;
        }
        state.pending.push_back(frame);
        drop(state);
        self.available.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }
}

/// Receiving side of a subscription. Dropping it unsubscribes.
pub struct BusReceiver {
    mailbox: Arc<Mailbox>,
}

impl BusReceiver {
    /// Block until a frame arrives, the timeout elapses, or the bus closes.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SharedFrame> {
        let mut state = self.mailbox.state.lock().unwrap();
        loop {
            if let Some(frame) = state.pending.pop_front() {
                state.last_delivered_seq = Some(frame.sequence);
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            let (next, result) = self
                .mailbox
                .available
                .wait_timeout(state, timeout)
                .unwrap();
            state = next;
            if result.timed_out() && state.pending.is_empty() {
                return None;
            }
        }
    }

    /// Non-blocking: take the newest pending frame, if any.
    pub fn try_recv(&self) -> Option<SharedFrame> {
        let mut state = self.mailbox.state.lock().unwrap();
        let frame = state.pending.pop_front()?;
        state.last_delivered_seq = Some(frame.sequence);
        Some(frame)
    }

    /// Frames discarded from this mailbox because the subscriber lagged.
    pub fn dropped_frames(&self) -> u64 {
        self.mailbox.state.lock().unwrap().dropped
    }

    /// Sequence number of the most recently delivered frame.
    pub fn last_sequence(&self) -> Option<u64> {
        self.mailbox.state.lock().unwrap().last_delivered_seq
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.state.lock().unwrap().closed
    }
}

impl Drop for BusReceiver {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}

/// Single-producer frame bus.
pub struct FrameBus {
    name: &'static str,
    next_sequence: AtomicU64,
    subscribers: Mutex<Vec<Weak<Mailbox>>>,
}

impl FrameBus {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_sequence: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe with the default latest-wins mailbox (depth 1).
    pub fn subscribe(&self, label: impl Into<String>) -> BusReceiver {
        self.subscribe_with_depth(label, DEFAULT_MAILBOX_DEPTH)
    }

    /// Subscribe with an explicit mailbox depth. Depth trades latency for
    /// completeness; 1 keeps only the newest frame.
    pub fn subscribe_with_depth(&self, label: impl Into<String>, depth: usize) -> BusReceiver {
        let mailbox = Arc::new(Mailbox {
            label: label.into(),
            depth: depth.max(1),
            state: Mutex::new(MailboxState {
                pending: VecDeque::new(),
                closed: false,
                dropped: 0,
                last_delivered_seq: None,
            }),
            available: Condvar::new(),
        });
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.push(Arc::downgrade(&mailbox));
        log::debug!("{}: subscriber '{}' attached", self.name, mailbox.label);
        BusReceiver { mailbox }
    }

    /// Tag a captured frame with the next sequence number, fan it out to all
    /// live subscribers, and return the shared handle for the synchronous
    /// consumer. Never blocks.
    pub fn ingest(&self, captured: CapturedFrame) -> SharedFrame {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let frame = Arc::new(Frame {
            width: captured.width,
            height: captured.height,
            data: captured.data,
            pts: captured.pts,
            sequence,
        });
        self.publish(frame.clone());
        frame
    }

    /// Fan out an already-tagged frame (used for the post-effects stream).
    pub fn publish(&self, frame: SharedFrame) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|slot| match slot.upgrade() {
            Some(mailbox) => {
                mailbox.push(frame.clone());
                true
            }
            None => false,
        });
    }

    /// Close every subscriber mailbox; blocked receivers wake with `None`.
    pub fn close(&self) {
        let subscribers = self.subscribers.lock().unwrap();
        for slot in subscribers.iter() {
            if let Some(mailbox) = slot.upgrade() {
                mailbox.close();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|slot| slot.strong_count() > 0);
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn captured(n: u32) -> CapturedFrame {
        CapturedFrame {
            width: 4,
            height: 4,
            data: vec![n as u8; 48],
            pts: Duration::from_millis(u64::from(n) * 33),
        }
    }

    #[test]
    fn sequences_are_monotonic() {
        let bus = FrameBus::new("test");
        let a = bus.ingest(captured(0));
        let b = bus.ingest(captured(1));
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
    }

    #[test]
    fn latest_wins_when_subscriber_lags() {
        let bus = FrameBus::new("test");
        let rx = bus.subscribe("lagging");

        for n in 0..5 {
            bus.ingest(captured(n));
        }

        // Only the newest frame is pending; the rest were discarded oldest
        // first, observable as a sequence gap plus the drop counter.
        let frame = rx.try_recv().expect("one pending frame");
        assert_eq!(frame.sequence, 4);
        assert!(rx.try_recv().is_none());
        assert_eq!(rx.dropped_frames(), 4);
    }

    #[test]
    fn deeper_mailbox_keeps_more_frames() {
        let bus = FrameBus::new("test");
        let rx = bus.subscribe_with_depth("deep", 3);
        for n in 0..5 {
            bus.ingest(captured(n));
        }
        let sequences: Vec<u64> = std::iter::from_fn(|| rx.try_recv())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(sequences, vec![2, 3, 4]);
        assert_eq!(rx.dropped_frames(), 2);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let bus = Arc::new(FrameBus::new("test"));
        let rx = bus.subscribe("blocked");
        let bus2 = bus.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            bus2.close();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_none());
        handle.join().unwrap();
    }

    #[test]
    fn dropped_receiver_detaches_from_bus() {
        let bus = FrameBus::new("test");
        let rx = bus.subscribe("transient");
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.ingest(captured(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn ingest_returns_same_buffer_no_copy() {
        let bus = FrameBus::new("test");
        let rx = bus.subscribe("async");
        let sync_handle = bus.ingest(captured(7));
        let async_handle = rx.try_recv().unwrap();
        assert!(Arc::ptr_eq(&sync_handle, &async_handle));
    }
}
