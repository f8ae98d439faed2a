//! Correlation of method returns with outstanding calls.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;

/// The reply to a pending call. A remote error arrives as a regular
/// message; an `Err` means the connection went away.
pub(crate) type Reply = Result<Message, Error>;

/// Tracks calls which await a reply, keyed by serial.
///
/// The mutex is only held for map operations, never across an await.
pub(crate) struct Correlator {
    state: Mutex<State>,
}

struct State {
    open: bool,
    waiting: HashMap<NonZeroU32, oneshot::Sender<Reply>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                open: true,
                waiting: HashMap::new(),
            }),
        }
    }

    /// Register an outstanding call, returning the receiver its reply will
    /// be delivered on.
    pub(crate) fn register(&self, serial: NonZeroU32) -> Result<oneshot::Receiver<Reply>> {
        let mut state = self.lock();

        if !state.open {
            return Err(ErrorKind::ConnectionClosed.into());
        }

        let (tx, rx) = oneshot::channel();
        state.waiting.insert(serial, tx);
        Ok(rx)
    }

    /// Deliver a reply to the call it correlates with. Returns the message
    /// back if no call is waiting for it, which the caller is expected to
    /// drop after logging.
    pub(crate) fn complete(&self, reply_serial: NonZeroU32, reply: Message) -> Option<Message> {
        let tx = self.lock().waiting.remove(&reply_serial);

        match tx {
            Some(tx) => match tx.send(Ok(reply)) {
                Ok(()) => None,
                // The caller stopped waiting between removal and delivery.
                Err(Ok(reply)) => Some(reply),
                Err(Err(..)) => None,
            },
            None => Some(reply),
        }
    }

    /// Stop waiting for the given serial. A reply arriving afterwards is
    /// treated as unmatched.
    pub(crate) fn forget(&self, serial: NonZeroU32) {
        self.lock().waiting.remove(&serial);
    }

    /// Tear down the correlator, failing every outstanding call. Idempotent.
    pub(crate) fn close(&self) {
        let waiting = {
            let mut state = self.lock();
            state.open = false;
            std::mem::take(&mut state.waiting)
        };

        for (_, tx) in waiting {
            let _ = tx.send(Err(ErrorKind::ConnectionClosed.into()));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn reply_to(n: u32) -> Message {
        Message::method_return(serial(1000 + n), serial(n))
    }

    #[tokio::test]
    async fn out_of_order_completion() {
        let correlator = Correlator::new();

        let a = correlator.register(serial(1)).unwrap();
        let b = correlator.register(serial(2)).unwrap();

        assert!(correlator.complete(serial(2), reply_to(2)).is_none());
        assert!(correlator.complete(serial(1), reply_to(1)).is_none());

        let reply = a.await.unwrap().unwrap();
        assert_eq!(reply.reply_serial(), Some(serial(1)));

        let reply = b.await.unwrap().unwrap();
        assert_eq!(reply.reply_serial(), Some(serial(2)));
    }

    #[tokio::test]
    async fn unmatched_reply_returned() {
        let correlator = Correlator::new();
        assert!(correlator.complete(serial(7), reply_to(7)).is_some());
    }

    #[tokio::test]
    async fn forgotten_call_is_unmatched() {
        let correlator = Correlator::new();

        let rx = correlator.register(serial(1)).unwrap();
        correlator.forget(serial(1));

        assert!(correlator.complete(serial(1), reply_to(1)).is_some());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn close_fans_out() {
        let correlator = Correlator::new();

        let a = correlator.register(serial(1)).unwrap();
        let b = correlator.register(serial(2)).unwrap();

        correlator.close();
        correlator.close();

        assert!(a.await.unwrap().unwrap_err().is_connection_closed());
        assert!(b.await.unwrap().unwrap_err().is_connection_closed());

        let error = correlator.register(serial(3)).unwrap_err();
        assert!(error.is_connection_closed());
    }
}
