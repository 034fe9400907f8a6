//! Request/response bus orchestration.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::encode::{JsonEncoder, ValueEncoder};
use crate::error::{BusError, BusResult};
use crate::section::ResultStream;
use crate::stream::cancelled;
use crate::token::SenderToken;

/// Default bound for the caller's wait and for every stream hand-off.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// An opaque request payload. The bus never interprets or mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub data: Bytes,
}

impl Request {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// An opaque response payload produced by a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub data: Bytes,
}

impl Response {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The per-request callback. Runs on its own task with a single-use
/// [`SenderToken`] and the request; may outlive the originating
/// [`Bus::send_request`] call when it only handed over a stream.
pub type RequestHandler = Arc<dyn Fn(SenderToken, Request) -> HandlerFuture + Send + Sync>;

/// What a request resolves to when the handler replies in time.
#[derive(Debug)]
pub enum Reply {
    /// A single buffered response.
    Response(Response),
    /// A live result stream; drain it section by section while the
    /// handler keeps feeding it.
    Stream(ResultStream),
}

enum Raced {
    Reply(Reply),
    TokenDropped,
    Cancelled,
    TimedOut,
}

/// The in-process request/response bus.
///
/// Dispatches every request to one handler running concurrently, and
/// resolves the caller's wait to a buffered response, a result stream,
/// or an error, never later than the caller's timeout or cancellation.
pub struct Bus {
    handler: RequestHandler,
    encoder: Arc<dyn ValueEncoder>,
}

impl Bus {
    /// Create a bus that dispatches every request to `handler`.
    pub fn new(handler: RequestHandler) -> Self {
        Self {
            handler,
            encoder: Arc::new(JsonEncoder),
        }
    }

    /// Replace the encoder used for structured element values.
    pub fn with_encoder(mut self, encoder: Arc<dyn ValueEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Submit a request and wait for the handler's reply.
    ///
    /// The handler runs on its own task, holding a single-use
    /// [`SenderToken`]. The wait resolves to the first of: the handler's
    /// reply (a response or a stream upgrade), the cancellation signal,
    /// or the timeout. The same timeout bounds every hand-off inside a
    /// resulting stream.
    ///
    /// If the cancellation signal is observed to have fired by the time
    /// the race resolves, cancellation wins over any other outcome,
    /// including a delivered reply.
    ///
    /// A handler that panics, or that drops its token without replying,
    /// is reported as [`BusError::HandlerFault`]; the panic never reaches
    /// the caller's task.
    pub async fn send_request(
        &self,
        request: Request,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> BusResult<Reply> {
        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = oneshot::channel();
        let token = SenderToken::new(reply_tx, timeout, cancel.clone(), Arc::clone(&self.encoder));
        let handler = tokio::spawn((self.handler)(token, request));

        let raced = tokio::select! {
            reply = reply_rx => match reply {
                Ok(reply) => Raced::Reply(reply),
                Err(_) => Raced::TokenDropped,
            },
            _ = cancelled(&mut cancel) => Raced::Cancelled,
            _ = time::sleep_until(deadline) => Raced::TimedOut,
        };

        let outcome = match raced {
            Raced::Reply(reply) => Ok(reply),
            // The token is gone without a reply: the handler panicked or
            // finished without using it. Let the task settle, still
            // bounded by the same deadline, so the fault can be reported.
            Raced::TokenDropped => Err(settle_fault(handler, deadline, &mut cancel).await),
            Raced::Cancelled => Err(BusError::Cancelled),
            Raced::TimedOut => Err(BusError::Timeout),
        };

        // The reply and the cancellation signal can become ready in the
        // same instant; cancellation observed now still wins.
        if *cancel.borrow() {
            return Err(BusError::Cancelled);
        }

        if let Err(error) = &outcome {
            debug!(%error, "request did not produce a reply");
        }
        outcome
    }
}

async fn settle_fault(
    handler: JoinHandle<()>,
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
) -> BusError {
    tokio::select! {
        joined = handler => fault(joined),
        _ = cancelled(cancel) => BusError::Cancelled,
        _ = time::sleep_until(deadline) => BusError::Timeout,
    }
}

fn fault(joined: Result<(), JoinError>) -> BusError {
    let fault = match joined {
        Ok(()) => BusError::HandlerFault("handler finished without replying".to_owned()),
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = if let Some(message) = payload.downcast_ref::<&str>() {
                (*message).to_owned()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "handler panicked".to_owned()
            };
            BusError::HandlerFault(message)
        }
        Err(_) => BusError::HandlerFault("handler task was cancelled".to_owned()),
    };
    warn!(%fault, "request handler failed");
    fault
}
