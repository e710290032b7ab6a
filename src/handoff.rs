//! Bounded single-producer/single-consumer handoff between pipeline stages
//!
//! Wraps a `crossbeam_channel::bounded` queue with an explicit end-of-stream
//! message, so the consumer can tell a producer that finished cleanly from one
//! that died halfway through.

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::errors::MarkDupError;

enum Message<T> {
    Item(T),
    Done,
}

/// Producer half. Dropping it without calling [`HandoffSender::finish`]
/// makes the consumer's next `take` fail.
pub struct HandoffSender<T> {
    tx: Sender<Message<T>>,
}

/// Consumer half.
pub struct HandoffReceiver<T> {
    rx: Receiver<Message<T>>,
    finished: bool,
}

/// Create a channel holding at most `capacity` in-flight items (minimum 1).
pub fn handoff<T>(capacity: usize) -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        HandoffSender { tx },
        HandoffReceiver {
            rx,
            finished: false,
        },
    )
}

impl<T> HandoffSender<T> {
    /// Blocks while the channel is full.
    pub fn put(&self, item: T) -> Result<(), MarkDupError> {
        self.tx
            .send(Message::Item(item))
            .map_err(|_| MarkDupError::ConsumerDisconnected)
    }

    /// Push the end-of-stream sentinel and release the sender.
    pub fn finish(self) -> Result<(), MarkDupError> {
        self.tx
            .send(Message::Done)
            .map_err(|_| MarkDupError::ConsumerDisconnected)
    }
}

impl<T> HandoffReceiver<T> {
    /// Blocks while the channel is empty.
    ///
    /// Returns `Ok(None)` exactly once, after the producer finished and every
    /// item was drained.
    pub fn take(&mut self) -> Result<Option<T>, MarkDupError> {
        if self.finished {
            return Err(MarkDupError::HandoffDrained);
        }
        match self.rx.recv() {
            Ok(Message::Item(item)) => Ok(Some(item)),
            Ok(Message::Done) => {
                self.finished = true;
                Ok(None)
            }
            Err(_) => Err(MarkDupError::ProducerDisconnected),
        }
    }
}

/// Combine the outcomes of a producer/consumer pair.
///
/// When one side fails the other usually fails too, with a disconnect error;
/// the disconnect is only reported when there is nothing more specific.
pub fn join_stages<P, C>(
    stage: &'static str,
    produced: std::thread::Result<anyhow::Result<P>>,
    consumed: anyhow::Result<C>,
) -> anyhow::Result<(P, C)> {
    let produced = produced.map_err(|_| MarkDupError::WorkerPanicked { stage })?;
    match (produced, consumed) {
        (Ok(p), Ok(c)) => Ok((p, c)),
        (Err(p), Err(c)) => {
            if is_disconnect(&c) {
                Err(p)
            } else {
                Err(c)
            }
        }
        (Err(p), Ok(_)) => Err(p),
        (Ok(_), Err(c)) => Err(c),
    }
}

fn is_disconnect(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MarkDupError>(),
        Some(MarkDupError::ProducerDisconnected | MarkDupError::ConsumerDisconnected)
    )
}
