//! Single-use reply token handed to request handlers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::bus::{Reply, Response};
use crate::encode::ValueEncoder;
use crate::stream::{result_channel, ResultSender};

/// Grants a request handler exactly one reply action: a final response,
/// or an upgrade to streamed delivery.
///
/// The token owns the one-shot reply path back to the waiting caller.
/// Using it a second time is a protocol violation by the handler and
/// panics deterministically; it is never silently ignored.
pub struct SenderToken {
    reply: Mutex<Option<oneshot::Sender<Reply>>>,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
    encoder: Arc<dyn ValueEncoder>,
}

impl SenderToken {
    pub(crate) fn new(
        reply: oneshot::Sender<Reply>,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
        encoder: Arc<dyn ValueEncoder>,
    ) -> Self {
        Self {
            reply: Mutex::new(Some(reply)),
            timeout,
            cancel,
            encoder,
        }
    }

    /// Deliver the final response for this request.
    ///
    /// # Panics
    ///
    /// Panics if the token has already been used.
    pub fn send_response(&self, response: Response) {
        if self.consume().send(Reply::Response(response)).is_err() {
            // The caller stopped waiting (timeout or cancellation).
            debug!("response dropped, caller no longer waiting");
        }
    }

    /// Switch this request to streamed delivery.
    ///
    /// Hands the consumer half across to the waiting caller and returns
    /// the producer half for this handler to write sections to. The
    /// stream inherits the request's timeout, cancellation signal, and
    /// encoder.
    ///
    /// # Panics
    ///
    /// Panics if the token has already been used.
    pub fn upgrade_to_stream(&self) -> ResultSender {
        let reply = self.consume();
        let (sender, stream) = result_channel(
            self.timeout,
            self.cancel.clone(),
            Arc::clone(&self.encoder),
        );
        if reply.send(Reply::Stream(stream)).is_err() {
            // Writes to the returned sender will fail fast with NoConsumer.
            debug!("stream dropped, caller no longer waiting");
        }
        sender
    }

    fn consume(&self) -> oneshot::Sender<Reply> {
        self.reply
            .lock()
            .expect("reply slot lock poisoned")
            .take()
            .expect("sender token already consumed")
    }
}
