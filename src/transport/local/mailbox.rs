//! Per-rank message queues of the local transport.

use crate::error::{Error, MpiErrorClass, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// How long a blocked rank sleeps before re-checking for an aborted peer.
const ABORT_POLL: Duration = Duration::from_millis(50);

/// Completion flag of a synchronous send, set when the receive matches it.
#[derive(Debug, Default)]
pub(crate) struct Handshake {
    matched: AtomicBool,
}

impl Handshake {
    pub(crate) fn complete(&self) {
        self.matched.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.matched.load(Ordering::SeqCst)
    }
}

/// A message in flight.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) context: u32,
    pub(crate) source: i32,
    pub(crate) tag: i32,
    pub(crate) payload: Vec<u8>,
    pub(crate) handshake: Option<Arc<Handshake>>,
}

/// Which messages a receive or probe accepts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pattern {
    pub(crate) context: u32,
    pub(crate) source: Option<i32>,
    pub(crate) tag: Option<i32>,
}

impl Pattern {
    fn matches(&self, envelope: &Envelope) -> bool {
        envelope.context == self.context
            && self.source.map_or(true, |s| s == envelope.source)
            && self.tag.map_or(true, |t| t == envelope.tag)
    }
}

/// Incoming messages of one rank, in arrival order.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    arrived: Condvar,
}

impl Mailbox {
    pub(crate) fn deliver(&self, envelope: Envelope) {
        let mut queue = lock(&self.queue);
        queue.push_back(envelope);
        self.arrived.notify_all();
    }

    /// Remove the oldest message matching `pattern`. Waits for one if `block`.
    pub(crate) fn take(
        &self,
        pattern: Pattern,
        block: bool,
        aborted: &AtomicBool,
    ) -> Result<Option<Envelope>> {
        let mut queue = lock(&self.queue);
        loop {
            if let Some(pos) = queue.iter().position(|e| pattern.matches(e)) {
                return Ok(queue.remove(pos));
            }
            if !block {
                return Ok(None);
            }
            queue = self.wait(queue, aborted)?;
        }
    }

    /// `(source, tag, bytes)` of the oldest message matching `pattern`.
    pub(crate) fn peek(
        &self,
        pattern: Pattern,
        block: bool,
        aborted: &AtomicBool,
    ) -> Result<Option<(i32, i32, usize)>> {
        let mut queue = lock(&self.queue);
        loop {
            if let Some(e) = queue.iter().find(|e| pattern.matches(e)) {
                return Ok(Some((e.source, e.tag, e.payload.len())));
            }
            if !block {
                return Ok(None);
            }
            queue = self.wait(queue, aborted)?;
        }
    }

    /// Sleep until a message arrives or `timeout` passes.
    pub(crate) fn idle(&self, timeout: Duration) {
        let queue = lock(&self.queue);
        let _ = self.arrived.wait_timeout(queue, timeout);
    }

    /// Wake every rank blocked on this mailbox.
    pub(crate) fn wake(&self) {
        let _queue = lock(&self.queue);
        self.arrived.notify_all();
    }

    fn wait<'a>(
        &self,
        queue: MutexGuard<'a, VecDeque<Envelope>>,
        aborted: &AtomicBool,
    ) -> Result<MutexGuard<'a, VecDeque<Envelope>>> {
        if aborted.load(Ordering::SeqCst) {
            return Err(peer_aborted());
        }
        Ok(match self.arrived.wait_timeout(queue, ABORT_POLL) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn peer_aborted() -> Error {
    Error::transport(
        MpiErrorClass::Other.as_raw(),
        MpiErrorClass::Other,
        "a peer rank aborted",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(source: i32, tag: i32, payload: &[u8]) -> Envelope {
        Envelope {
            context: 0,
            source,
            tag,
            payload: payload.to_vec(),
            handshake: None,
        }
    }

    #[test]
    fn take_respects_arrival_order_per_pattern() {
        let mailbox = Mailbox::default();
        let aborted = AtomicBool::new(false);
        mailbox.deliver(envelope(1, 7, b"a"));
        mailbox.deliver(envelope(2, 7, b"b"));
        mailbox.deliver(envelope(1, 7, b"c"));

        let from_one = Pattern {
            context: 0,
            source: Some(1),
            tag: Some(7),
        };
        let first = mailbox.take(from_one, false, &aborted).unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        let second = mailbox.take(from_one, false, &aborted).unwrap().unwrap();
        assert_eq!(second.payload, b"c");
        assert!(mailbox.take(from_one, false, &aborted).unwrap().is_none());

        let any = Pattern {
            context: 0,
            source: None,
            tag: None,
        };
        assert_eq!(mailbox.peek(any, false, &aborted).unwrap(), Some((2, 7, 1)));
    }

    #[test]
    fn contexts_are_separate() {
        let mailbox = Mailbox::default();
        let aborted = AtomicBool::new(false);
        mailbox.deliver(envelope(0, 0, b"x"));
        let other_context = Pattern {
            context: 1,
            source: None,
            tag: None,
        };
        assert!(mailbox.take(other_context, false, &aborted).unwrap().is_none());
    }

    #[test]
    fn blocked_take_fails_after_abort() {
        let mailbox = Mailbox::default();
        let aborted = AtomicBool::new(true);
        let pattern = Pattern {
            context: 0,
            source: None,
            tag: None,
        };
        assert!(mailbox.take(pattern, true, &aborted).is_err());
    }

    #[test]
    fn handshake_completes() {
        let handshake = Handshake::default();
        assert!(!handshake.is_complete());
        handshake.complete();
        assert!(handshake.is_complete());
    }
}
