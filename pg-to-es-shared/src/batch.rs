//! Bounded, ordered groups of events or mutations.

use crate::dead_letter::DeadLetterRecord;
use crate::event::ChangeEvent;
use crate::position::ResumePosition;

/// An ordered group of items that is checkpointed as a unit.
///
/// The batch position is that of its last change-log entry. It stays the
/// same after transformation, even when coalescing or dead-lettering leaves
/// no mutation behind, so a resolved batch always advances the checkpoint.
///
/// Entries given up on before the batch was formed travel with it as
/// dead letters, so they are recorded before the checkpoint passes them.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    id: u64,
    items: Vec<T>,
    position: ResumePosition,
    dead_letters: Vec<DeadLetterRecord>,
}

impl<T> Batch<T> {
    /// Create a batch with an explicit checkpoint position.
    pub fn new(id: u64, items: Vec<T>, position: ResumePosition) -> Self {
        Self {
            id,
            items,
            position,
            dead_letters: Vec::new(),
        }
    }

    /// Attach dead letters recorded when the batch resolves.
    pub fn with_dead_letters(mut self, dead_letters: Vec<DeadLetterRecord>) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    /// Entries given up on upstream of this batch.
    pub fn dead_letters(&self) -> &[DeadLetterRecord] {
        &self.dead_letters
    }

    /// Sequential id assigned by the batcher, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Items in arrival order.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Consume the batch, returning its items.
    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// The checkpoint value if this batch resolves.
    pub fn position(&self) -> &ResumePosition {
        &self.position
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the items, keeping id, position and dead letters.
    pub fn with_items<U>(self, items: Vec<U>) -> Batch<U> {
        Batch {
            id: self.id,
            items,
            position: self.position,
            dead_letters: self.dead_letters,
        }
    }
}

impl Batch<ChangeEvent> {
    /// Build a batch from events, positioned at the last one.
    ///
    /// Returns `None` for an empty event list.
    pub fn from_events(id: u64, events: Vec<ChangeEvent>) -> Option<Self> {
        let position = events.last()?.position.clone();
        Some(Self::new(id, events, position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PrimaryKey;

    #[test]
    fn test_from_events_takes_last_position() {
        let events = vec![
            ChangeEvent::delete("film_work", PrimaryKey::new().with("id", 1), ResumePosition::stream(4)),
            ChangeEvent::delete("film_work", PrimaryKey::new().with("id", 2), ResumePosition::stream(9)),
        ];

        let batch = Batch::from_events(1, events).unwrap();
        assert_eq!(batch.position(), &ResumePosition::stream(9));
        assert_eq!(batch.len(), 2);
        assert!(Batch::from_events(2, Vec::new()).is_none());
    }

    #[test]
    fn test_with_items_keeps_position() {
        let record = DeadLetterRecord::from_source_entry(
            "film_work",
            "",
            ResumePosition::stream(11),
            "Missing primary key",
            serde_json::Value::Null,
        );
        let batch = Batch::new(3, vec![1, 2, 3], ResumePosition::stream(12)).with_dead_letters(vec![record]);
        let mapped: Batch<String> = batch.with_items(Vec::new());
        assert_eq!(mapped.id(), 3);
        assert!(mapped.is_empty());
        assert_eq!(mapped.position(), &ResumePosition::stream(12));
        assert_eq!(mapped.dead_letters().len(), 1);
    }
}
