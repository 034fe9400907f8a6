//! Producer side of a sectioned result stream.
//!
//! The producer writes in a strict shape: start a section, send its
//! elements, start the next section (which finalizes the previous one),
//! and close. A started section travels to the consumer together with its
//! first element; a section that never receives one is never delivered.
//!
//! Every hand-off to the consumer is a rendezvous: the producer blocks
//! until the consumer has actually picked the item up, bounded by the
//! stream timeout and the request's cancellation signal. The first failed
//! hand-off is sticky, so a producer is never stalled twice by the same
//! dead consumer.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tracing::debug;

use crate::encode::{ElementValue, ValueEncoder};
use crate::error::{BusError, BusResult, SendFailure};
use crate::section::{ResultStream, Section, SectionKind};

/// One delivery over a stream channel. The receiver acks through the
/// enclosed sender; a delivery whose ack channel is gone was abandoned by
/// the producer and must not be observed.
pub(crate) type Handoff<T> = (T, oneshot::Sender<()>);

/// One named-or-unnamed element payload within a section.
#[derive(Debug)]
pub(crate) struct Element {
    pub(crate) name: String,
    pub(crate) value: Bytes,
}

/// Create a connected producer/consumer pair for one result stream.
pub(crate) fn result_channel(
    timeout: Duration,
    cancel: watch::Receiver<bool>,
    encoder: Arc<dyn ValueEncoder>,
) -> (ResultSender, ResultStream) {
    let (sections_tx, sections_rx) = mpsc::channel(1);
    let completion = Arc::new(OnceLock::new());
    let sender = ResultSender {
        sections: Some(sections_tx),
        elements: None,
        pending: None,
        sticky: None,
        timeout,
        cancel,
        encoder,
        completion: Arc::clone(&completion),
    };
    (sender, ResultStream::new(sections_rx, completion))
}

/// Resolves when the cancellation signal fires; never resolves if the
/// signal's sender is gone (such a request can no longer be cancelled).
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|fired| *fired).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Hand one item to the consumer, blocking until it is picked up.
///
/// The tie-break is deliberate: a delivery the consumer acked before the
/// deadline counts, even if cancellation or the deadline fire in the same
/// instant.
async fn handoff<T>(
    tx: &mpsc::Sender<Handoff<T>>,
    item: T,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), SendFailure> {
    let (ack_tx, ack_rx) = oneshot::channel();
    let delivery = async {
        if tx.send((item, ack_tx)).await.is_err() {
            // Consumer handle dropped; nothing will ever read this stream.
            return Err(SendFailure::NoConsumer);
        }
        match ack_rx.await {
            Ok(()) => Ok(()),
            Err(_) => Err(SendFailure::NoConsumer),
        }
    };
    tokio::select! {
        biased;
        delivered = delivery => delivered,
        _ = cancelled(cancel) => Err(SendFailure::Cancelled),
        _ = time::sleep(timeout) => Err(SendFailure::NoConsumer),
    }
}

/// Producer handle over a sectioned result stream.
///
/// Handed to the request handler by
/// [`SenderToken::upgrade_to_stream`](crate::SenderToken::upgrade_to_stream);
/// inherits the request's timeout, cancellation signal, and encoder.
pub struct ResultSender {
    /// `None` once the stream is closed.
    sections: Option<mpsc::Sender<Handoff<Section>>>,
    /// Element channel of the currently open section; `None` before the
    /// first section is started.
    elements: Option<mpsc::Sender<Handoff<Element>>>,
    /// Started but not yet handed to the consumer.
    pending: Option<Section>,
    sticky: Option<SendFailure>,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
    encoder: Arc<dyn ValueEncoder>,
    completion: Arc<OnceLock<anyhow::Error>>,
}

impl ResultSender {
    /// Open an array section; elements sent afterwards are unnamed.
    ///
    /// Finalizes the previously open section: its consumer view drains
    /// whatever was delivered and then sees the end of its elements.
    ///
    /// # Panics
    ///
    /// Panics if the stream has been closed.
    pub fn start_array_section(&mut self, section_type: &str, path: &[&str]) {
        self.start_section(SectionKind::Array, section_type, path);
    }

    /// Open a map section; elements sent afterwards carry their names.
    ///
    /// # Panics
    ///
    /// Panics if the stream has been closed.
    pub fn start_map_section(&mut self, section_type: &str, path: &[&str]) {
        self.start_section(SectionKind::Map, section_type, path);
    }

    /// Send a whole object section: a section carrying exactly one
    /// unnamed value.
    ///
    /// # Panics
    ///
    /// Panics if the stream has been closed.
    pub async fn object_section(
        &mut self,
        section_type: &str,
        path: &[&str],
        value: impl Into<ElementValue>,
    ) -> BusResult<()> {
        self.start_section(SectionKind::Object, section_type, path);
        self.send_element("", value).await
    }

    /// Send one element of the currently open section.
    ///
    /// An [`ElementValue::Empty`] value is a success no-op, so optional
    /// values can be sent without a presence check at the call site.
    /// Structured values are encoded by the stream's encoder; an encoding
    /// failure is returned from this call only and leaves the stream
    /// usable. Otherwise the element (preceded by its section, if this is
    /// the section's first element) is handed to the consumer under the
    /// stream's timeout and cancellation bounds, and any hand-off failure
    /// is sticky for the rest of the stream.
    ///
    /// # Panics
    ///
    /// Panics if no section has been started, or if the stream has been
    /// closed.
    pub async fn send_element(
        &mut self,
        name: &str,
        value: impl Into<ElementValue>,
    ) -> BusResult<()> {
        let value = value.into();
        if value.is_empty() {
            return Ok(());
        }
        let Some(sections) = self.sections.clone() else {
            panic!("result sender used after close");
        };
        let Some(elements) = self.elements.clone() else {
            panic!("section is not started");
        };
        if let Some(failure) = self.sticky {
            return Err(failure.into());
        }
        let payload = value.encode_with(self.encoder.as_ref())?;

        // The open section travels just ahead of its first element.
        if let Some(section) = self.pending.take() {
            if let Err(failure) = handoff(&sections, section, self.timeout, &mut self.cancel).await
            {
                return Err(self.record_failure(failure));
            }
        }
        let element = Element {
            name: name.to_owned(),
            value: payload,
        };
        if let Err(failure) = handoff(&elements, element, self.timeout, &mut self.cancel).await {
            return Err(self.record_failure(failure));
        }
        Ok(())
    }

    /// Finalize the stream.
    ///
    /// Ends the section sequence and the open section's element sequence;
    /// consumer reads past what was delivered return "no more" instead of
    /// blocking. A non-`None` error is written once into the stream's
    /// completion slot, readable by the consumer after it has observed
    /// the end of the sections.
    ///
    /// # Panics
    ///
    /// Panics if the stream has already been closed.
    pub fn close(&mut self, error: Option<anyhow::Error>) {
        if self.sections.is_none() {
            panic!("result sender used after close");
        }
        let had_error = error.is_some();
        if let Some(error) = error {
            let _ = self.completion.set(error);
        }
        // Dropping the senders is what ends both sequences.
        self.pending = None;
        self.elements = None;
        self.sections = None;
        debug!(had_error, "result stream closed");
    }

    fn start_section(&mut self, kind: SectionKind, section_type: &str, path: &[&str]) {
        if self.sections.is_none() {
            panic!("result sender used after close");
        }
        let (elements_tx, elements_rx) = mpsc::channel(1);
        // Replacing the element sender finalizes the previous section.
        self.elements = Some(elements_tx);
        self.pending = Some(Section::new(kind, section_type, path, elements_rx));
    }

    fn record_failure(&mut self, failure: SendFailure) -> BusError {
        debug!(?failure, "stream hand-off failed");
        self.sticky = Some(failure);
        failure.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::JsonEncoder;
    use crate::error::BusError;

    fn channel(timeout: Duration) -> (ResultSender, ResultStream, watch::Sender<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (sender, stream) = result_channel(timeout, cancel_rx, Arc::new(JsonEncoder));
        (sender, stream, cancel_tx)
    }

    #[tokio::test]
    async fn elements_arrive_in_send_order() {
        let (mut sender, mut stream, _cancel) = channel(Duration::from_secs(1));

        let producer = tokio::spawn(async move {
            sender.start_array_section("array", &["path"]);
            sender.send_element("", "element1").await.unwrap();
            sender.send_element("", "element2").await.unwrap();
            sender.close(None);
        });

        let Some(Section::Array(mut array)) = stream.next_section().await else {
            panic!("expected an array section");
        };
        assert_eq!(array.section_type(), "array");
        assert_eq!(array.path(), ["path"]);
        assert_eq!(array.next().await.unwrap(), r#""element1""#);
        assert_eq!(array.next().await.unwrap(), r#""element2""#);
        assert_eq!(array.next().await, None);
        assert!(stream.next_section().await.is_none());

        producer.await.unwrap();
    }

    #[tokio::test]
    async fn starting_a_section_finalizes_the_previous_one() {
        let (mut sender, mut stream, _cancel) = channel(Duration::from_secs(1));

        let producer = tokio::spawn(async move {
            sender.start_array_section("first", &[]);
            sender.send_element("", "a").await.unwrap();
            sender.start_map_section("second", &[]);
            sender.send_element("key", "b").await.unwrap();
            sender.close(None);
        });

        let Some(Section::Array(mut first)) = stream.next_section().await else {
            panic!("expected an array section");
        };
        assert_eq!(first.next().await.unwrap(), r#""a""#);
        assert_eq!(first.next().await, None);

        let Some(Section::Map(mut second)) = stream.next_section().await else {
            panic!("expected a map section");
        };
        let (name, value) = second.next().await.unwrap();
        assert_eq!(name, "key");
        assert_eq!(value, r#""b""#);

        producer.await.unwrap();
    }

    #[tokio::test]
    async fn section_without_elements_is_never_delivered() {
        let (mut sender, mut stream, _cancel) = channel(Duration::from_secs(1));

        sender.start_array_section("empty", &[]);
        sender.close(None);

        assert!(stream.next_section().await.is_none());
    }

    #[tokio::test]
    async fn empty_value_is_a_no_op() {
        let (mut sender, mut stream, _cancel) = channel(Duration::from_secs(1));

        sender.start_array_section("array", &[]);
        sender
            .send_element("", Option::<&str>::None)
            .await
            .unwrap();
        sender.close(None);

        // The section never got a real element, so it was never delivered.
        assert!(stream.next_section().await.is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "section is not started")]
    async fn send_element_without_section_panics() {
        let (mut sender, _stream, _cancel) = channel(Duration::from_secs(1));
        let _ = sender.send_element("", "value").await;
    }

    #[tokio::test]
    #[should_panic(expected = "result sender used after close")]
    async fn send_after_close_panics() {
        let (mut sender, mut stream, _cancel) = channel(Duration::from_secs(1));

        let producer = tokio::spawn(async move {
            sender.object_section("", &[], 42).await.unwrap();
            sender.close(None);
            sender
        });

        let Some(Section::Object(mut object)) = stream.next_section().await else {
            panic!("expected an object section");
        };
        assert_eq!(object.value().await.unwrap(), "42");

        let mut sender = producer.await.unwrap();
        let _ = sender.object_section("", &[], 43).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unread_section_times_out_with_no_consumer() {
        let (mut sender, mut stream, _cancel) = channel(Duration::from_millis(50));

        let err = sender.object_section("", &[], 42).await.unwrap_err();
        assert!(matches!(err, BusError::NoConsumer));

        // The failure is sticky: later sends fail without waiting again.
        let before = time::Instant::now();
        let err = sender.object_section("", &[], 43).await.unwrap_err();
        assert!(matches!(err, BusError::NoConsumer));
        assert_eq!(time::Instant::now(), before);

        sender.close(None);
        assert!(stream.next_section().await.is_none());
        assert!(stream.completion_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fails_a_pending_send() {
        let (mut sender, mut stream, cancel) = channel(Duration::from_secs(60));

        let producer = tokio::spawn(async move {
            sender.start_array_section("", &[]);
            sender.send_element("", 0).await.unwrap();
            let err = sender.send_element("", 1).await.unwrap_err();
            assert!(matches!(err, BusError::Cancelled));
            sender.close(None);
        });

        let Some(Section::Array(mut array)) = stream.next_section().await else {
            panic!("expected an array section");
        };
        assert_eq!(array.next().await.unwrap(), "0");

        // Leave the second element pending and cancel the request.
        cancel.send(true).unwrap();
        producer.await.unwrap();

        assert!(stream.next_section().await.is_none());
    }

    #[tokio::test]
    async fn dropped_consumer_fails_sends_fast() {
        let (mut sender, stream, _cancel) = channel(Duration::from_secs(60));
        drop(stream);

        let err = sender.object_section("", &[], 42).await.unwrap_err();
        assert!(matches!(err, BusError::NoConsumer));
    }
}
