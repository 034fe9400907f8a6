//! In-process request/response bus with sectioned result streaming.
//!
//! A caller submits a [`Request`] through [`Bus::send_request`]; the bus
//! spawns the configured handler on its own task with a single-use
//! [`SenderToken`]. The handler either delivers one buffered [`Response`]
//! or upgrades the request to a live [`ResultStream`]: an ordered sequence
//! of sections (array / map / object), each an ordered sequence of
//! elements, fed by the handler while the caller drains it.
//!
//! # Delivery Model
//!
//! Producer and consumer meet at rendezvous points. Every hand-off (a
//! section or an element) blocks the producer until the consumer picks it
//! up, bounded by the request's timeout and cancellation signal; a
//! hand-off nobody accepted in time fails with `NoConsumer` and poisons
//! the stream, so a producer is never stalled twice by a dead consumer.
//!
//! # Guarantees
//!
//! - `send_request` resolves no later than its timeout or cancellation,
//!   whichever comes first; a handler panic is captured and reported as an
//!   error, never propagated onto the caller's task.
//! - Sections are observed in start order, elements in send order, and
//!   the end of the stream only after everything delivered has been
//!   observed.
//! - A [`SenderToken`] grants exactly one reply; a second use panics.
//! - Once a sequence is closed, reads return "no more" instead of
//!   blocking.

pub mod bus;
pub mod encode;
pub mod error;
pub mod section;
pub mod stream;
pub mod token;

pub use bus::{Bus, Reply, Request, RequestHandler, Response, DEFAULT_TIMEOUT};
pub use encode::{ElementValue, JsonEncoder, ValueEncoder};
pub use error::{BusError, BusResult};
pub use section::{ArraySection, MapSection, ObjectSection, ResultStream, Section};
pub use stream::ResultSender;
pub use token::SenderToken;
