//! The event queue: unbounded, many producers, one consumer.
//!
//! Monitors and the command path each hold a cloned [`EventSender`]; the
//! coordinator owns the only [`EventReceiver`]. Per-sender FIFO is what
//! `std::sync::mpsc` gives us, and nothing stronger is assumed.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::error::{KillError, MonitorError};
use crate::events::MonitorEvent;
use crate::monitor::MonitorSource;

pub type KillReply = Sender<Result<(), KillError>>;

#[derive(Debug)]
pub enum Command {
    Kill { pid: u32, reply: KillReply },
    MonitorStopped { source: MonitorSource, reason: String },
    Shutdown,
}

#[derive(Debug)]
pub enum QueueItem {
    Event(MonitorEvent),
    Command(Command),
}

pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel();
    (EventSender { tx }, EventReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<QueueItem>,
}

impl EventSender {
    /// Enqueues an event from `source`. Fails only once the coordinator is gone.
    pub fn send(&self, source: MonitorSource, event: MonitorEvent) -> Result<(), MonitorError> {
        self.tx
            .send(QueueItem::Event(event))
            .map_err(|_| MonitorError::ChannelClosed(source))
    }

    pub fn command(&self, command: Command) -> bool {
        self.tx.send(QueueItem::Command(command)).is_ok()
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<QueueItem>,
}

pub enum Pop {
    Item(QueueItem),
    Idle,
    Closed,
}

impl EventReceiver {
    pub fn pop(&self, timeout: Duration) -> Pop {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Pop::Item(item),
            Err(RecvTimeoutError::Timeout) => Pop::Idle,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    /// Takes whatever is already queued without waiting.
    pub fn try_pop(&self) -> Option<QueueItem> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::thread;

    fn vanished(pid: u32) -> MonitorEvent {
        MonitorEvent::ProcessVanished { pid, at: Utc::now() }
    }

    #[test]
    fn preserves_per_producer_order() {
        let (sender, receiver) = event_queue();
        let producers: Vec<_> = (0..3u32)
            .map(|producer| {
                let sender = sender.clone();
                thread::spawn(move || {
                    for seq in 0..100u32 {
                        sender
                            .send(MonitorSource::ResourceMonitor, vanished(producer * 1000 + seq))
                            .expect("send");
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("join");
        }

        let mut last_seen = [None::<u32>; 3];
        while let Some(item) = receiver.try_pop() {
            let QueueItem::Event(MonitorEvent::ProcessVanished { pid, .. }) = item else {
                panic!("unexpected item");
            };
            let (producer, seq) = ((pid / 1000) as usize, pid % 1000);
            if let Some(previous) = last_seen[producer] {
                assert!(seq > previous, "producer {producer} reordered");
            }
            last_seen[producer] = Some(seq);
        }
        assert_eq!(last_seen, [Some(99); 3]);
    }

    #[test]
    fn send_fails_after_consumer_drops() {
        let (sender, receiver) = event_queue();
        drop(receiver);
        let err = sender
            .send(MonitorSource::LogWatcher, vanished(1))
            .expect_err("closed");
        assert!(matches!(
            err,
            MonitorError::ChannelClosed(MonitorSource::LogWatcher)
        ));
        assert!(!sender.command(Command::Shutdown));
    }

    #[test]
    fn pop_reports_idle_then_closed() {
        let (sender, receiver) = event_queue();
        assert!(matches!(receiver.pop(Duration::from_millis(10)), Pop::Idle));
        drop(sender);
        assert!(matches!(receiver.pop(Duration::from_millis(10)), Pop::Closed));
    }
}
