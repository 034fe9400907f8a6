//! Consumer-side views over a sectioned result stream.
//!
//! A [`ResultStream`] yields [`Section`]s in the order the producer started
//! them; each section yields its elements in send order. Section metadata
//! is available immediately on receipt, independent of element draining.
//! Once a sequence ends, reads keep returning "no more" and never block.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::stream::{Element, Handoff};

/// Consumer handle over the ordered sequence of sections.
#[derive(Debug)]
pub struct ResultStream {
    sections: mpsc::Receiver<Handoff<Section>>,
    completion: Arc<OnceLock<anyhow::Error>>,
}

impl ResultStream {
    pub(crate) fn new(
        sections: mpsc::Receiver<Handoff<Section>>,
        completion: Arc<OnceLock<anyhow::Error>>,
    ) -> Self {
        Self {
            sections,
            completion,
        }
    }

    /// Receive the next section, blocking until the producer delivers one
    /// or closes the stream. Returns `None` once the stream is closed and
    /// everything delivered has been observed.
    pub async fn next_section(&mut self) -> Option<Section> {
        loop {
            let (section, ack) = self.sections.recv().await?;
            if ack.send(()).is_ok() {
                return Some(section);
            }
            // The producer gave up on this delivery before we picked it
            // up; it does not count as sent.
        }
    }

    /// The error the producer closed the stream with, if any.
    ///
    /// Written at most once, by the producer only. Meaningful after
    /// [`next_section`](Self::next_section) has returned `None`.
    pub fn completion_error(&self) -> Option<&anyhow::Error> {
        self.completion.get()
    }
}

/// One section of a streamed result.
#[derive(Debug)]
pub enum Section {
    /// Ordered, unnamed elements.
    Array(ArraySection),
    /// Ordered, named elements.
    Map(MapSection),
    /// Exactly one element value.
    Object(ObjectSection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectionKind {
    Array,
    Map,
    Object,
}

impl Section {
    pub(crate) fn new(
        kind: SectionKind,
        section_type: &str,
        path: &[&str],
        elements: mpsc::Receiver<Handoff<Element>>,
    ) -> Self {
        let meta = Meta {
            section_type: section_type.to_owned(),
            path: path.iter().map(|segment| (*segment).to_owned()).collect(),
        };
        match kind {
            SectionKind::Array => Section::Array(ArraySection { meta, elements }),
            SectionKind::Map => Section::Map(MapSection { meta, elements }),
            SectionKind::Object => Section::Object(ObjectSection {
                meta,
                elements,
                taken: false,
            }),
        }
    }

    /// The caller-defined section type label.
    pub fn section_type(&self) -> &str {
        match self {
            Section::Array(section) => section.section_type(),
            Section::Map(section) => section.section_type(),
            Section::Object(section) => section.section_type(),
        }
    }

    /// The section's position in the logical result tree.
    pub fn path(&self) -> &[String] {
        match self {
            Section::Array(section) => section.path(),
            Section::Map(section) => section.path(),
            Section::Object(section) => section.path(),
        }
    }
}

#[derive(Debug)]
struct Meta {
    section_type: String,
    path: Vec<String>,
}

/// Receive the next element the producer still stands behind.
async fn next_delivered(elements: &mut mpsc::Receiver<Handoff<Element>>) -> Option<Element> {
    loop {
        let (element, ack) = elements.recv().await?;
        if ack.send(()).is_ok() {
            return Some(element);
        }
        // Abandoned delivery; skip it.
    }
}

/// View over an array section: an ordered sequence of unnamed values.
#[derive(Debug)]
pub struct ArraySection {
    meta: Meta,
    elements: mpsc::Receiver<Handoff<Element>>,
}

impl ArraySection {
    pub fn section_type(&self) -> &str {
        &self.meta.section_type
    }

    pub fn path(&self) -> &[String] {
        &self.meta.path
    }

    /// The next element value, or `None` once this section's elements end.
    /// The end of a section is not the end of the stream.
    pub async fn next(&mut self) -> Option<Bytes> {
        next_delivered(&mut self.elements)
            .await
            .map(|element| element.value)
    }
}

/// View over a map section: an ordered sequence of named values.
#[derive(Debug)]
pub struct MapSection {
    meta: Meta,
    elements: mpsc::Receiver<Handoff<Element>>,
}

impl MapSection {
    pub fn section_type(&self) -> &str {
        &self.meta.section_type
    }

    pub fn path(&self) -> &[String] {
        &self.meta.path
    }

    /// The next `(name, value)` entry, or `None` once the section ends.
    pub async fn next(&mut self) -> Option<(String, Bytes)> {
        next_delivered(&mut self.elements)
            .await
            .map(|element| (element.name, element.value))
    }
}

/// View over an object section: a single value.
#[derive(Debug)]
pub struct ObjectSection {
    meta: Meta,
    elements: mpsc::Receiver<Handoff<Element>>,
    taken: bool,
}

impl ObjectSection {
    pub fn section_type(&self) -> &str {
        &self.meta.section_type
    }

    pub fn path(&self) -> &[String] {
        &self.meta.path
    }

    /// The section's single value on the first call, `None` on every call
    /// after that (and on the first, if the producer never sent one).
    pub async fn value(&mut self) -> Option<Bytes> {
        if self.taken {
            return None;
        }
        self.taken = true;
        next_delivered(&mut self.elements)
            .await
            .map(|element| element.value)
    }
}
