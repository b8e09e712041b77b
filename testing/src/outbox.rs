//! In-memory outbox and dead-letter store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tickets_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use tickets_core::message::{Event, MessageError, SerializedMessage, event_topic};
use tickets_core::outbox::{OutboxError, OutboxMessage, OutboxSource};
use uuid::Uuid;

#[derive(Clone, Debug)]
struct StoredRow {
    row: OutboxMessage,
    forwarded: bool,
}

/// In-memory outbox.
///
/// In-memory adapters call [`InMemoryOutbox::enqueue`] while holding their own
/// lock, which stands in for the shared database transaction.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOutbox {
    rows: Arc<Mutex<Vec<StoredRow>>>,
    failing_marks: Arc<AtomicUsize>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pending row.
    pub fn enqueue(&self, topic: impl Into<String>, message: SerializedMessage) {
        self.rows.lock().unwrap().push(StoredRow {
            row: OutboxMessage::new(topic, message),
            forwarded: false,
        });
    }

    /// Serializes `event` and appends it as a pending row.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] if the event cannot be serialized.
    pub fn enqueue_event<E: Event>(&self, event: &E) -> Result<(), MessageError> {
        let message = SerializedMessage::from_message(event)?;
        self.enqueue(event_topic::<E>(), message);
        Ok(())
    }

    /// Makes the next `count` `mark_forwarded` calls fail, as if the process
    /// died right after publishing.
    pub fn fail_next_marks(&self, count: usize) {
        self.failing_marks.store(count, Ordering::SeqCst);
    }

    /// Number of rows not yet forwarded.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.rows.lock().unwrap().iter().filter(|r| !r.forwarded).count()
    }

    /// Every row ever enqueued, forwarded or not.
    #[must_use]
    pub fn all(&self) -> Vec<OutboxMessage> {
        self.rows.lock().unwrap().iter().map(|r| r.row.clone()).collect()
    }
}

impl OutboxSource for InMemoryOutbox {
    fn fetch_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send + '_>> {
        let pending = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !r.forwarded)
            .take(limit)
            .map(|r| r.row.clone())
            .collect();
        Box::pin(std::future::ready(Ok(pending)))
    }

    fn mark_forwarded(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        let failed = self
            .failing_marks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            let error = OutboxError::Storage("injected failure".to_string());
            return Box::pin(std::future::ready(Err(error)));
        }

        let mut rows = self.rows.lock().unwrap();
        if let Some(stored) = rows.iter_mut().find(|r| r.row.id == id) {
            stored.forwarded = true;
        }
        Box::pin(std::future::ready(Ok(())))
    }
}

/// In-memory dead-letter store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetters {
    entries: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything dead-lettered so far.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of dead letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether nothing was dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn add(
        &self,
        entry: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        self.entries.lock().unwrap().push(entry);
        Box::pin(std::future::ready(Ok(())))
    }
}
