use std::collections::{HashMap, VecDeque};

use quorum_protocol::{MessageAckPayload, MessageBroadcastPayload};

/// Optimistic entry shown before the server confirms the send. Lives only
/// on the client; the server sees it as `client_message_id` on the send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub temp_id: String,
    pub author_id: String,
    pub content: String,
    pub sent_at_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Pending(PendingSend),
    Confirmed(MessageBroadcastPayload),
}

impl CacheEntry {
    /// The identity this entry is indexed under: the durable message id
    /// once confirmed, the temp id while pending.
    #[must_use]
    pub fn cache_id(&self) -> &str {
        match self {
            Self::Pending(pending) => &pending.temp_id,
            Self::Confirmed(message) => &message.id,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("an entry with id `{0}` already exists")]
    DuplicateId(String),
}

/// What `apply_ack` did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Successful ack: the broadcast performs the real replacement.
    Kept,
    /// Failed ack: the matching pending entry was removed.
    RolledBack,
    /// No pending entry matched the ack's `client_message_id`.
    Unmatched,
}

/// What `apply_broadcast` did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// A pending entry was replaced in place, position preserved.
    Replaced,
    /// A new confirmed message was inserted at the head.
    Prepended,
    /// A message with this id was already cached; the event was dropped.
    Duplicate,
}

/// Ordered (newest-first), id-deduplicated message cache: a slot arena
/// plus an ordering deque and an id index, so optimistic insert,
/// replace-by-client-id, and dedup-by-id are O(1) transitions instead of
/// array splices.
#[derive(Debug, Default)]
pub struct MessageCache {
    entries: HashMap<u64, CacheEntry>,
    order: VecDeque<u64>,
    index: HashMap<String, u64>,
    next_slot: u64,
    needs_resync: bool,
}

impl MessageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Entries newest-first, the display order.
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.order.iter().filter_map(|slot| self.entries.get(slot))
    }

    /// True after a reconnect until the history refetch lands.
    #[must_use]
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Optimistic send: insert the pending entry at the head immediately.
    ///
    /// # Errors
    /// Returns [`CacheError::DuplicateId`] when the temp id collides with
    /// an existing entry.
    pub fn push_pending(&mut self, pending: PendingSend) -> Result<(), CacheError> {
        if self.index.contains_key(&pending.temp_id) {
            return Err(CacheError::DuplicateId(pending.temp_id));
        }
        let slot = self.allocate();
        self.index.insert(pending.temp_id.clone(), slot);
        self.entries.insert(slot, CacheEntry::Pending(pending));
        self.order.push_front(slot);
        Ok(())
    }

    /// Apply the send outcome. Success never mutates the cache; failure
    /// rolls the pending entry back. No automatic retry either way.
    pub fn apply_ack(&mut self, ack: &MessageAckPayload) -> AckOutcome {
        if ack.success {
            return AckOutcome::Kept;
        }
        let Some(temp_id) = ack.client_message_id.as_deref() else {
            return AckOutcome::Unmatched;
        };
        let Some(slot) = self.index.get(temp_id).copied() else {
            return AckOutcome::Unmatched;
        };
        if !matches!(self.entries.get(&slot), Some(CacheEntry::Pending(_))) {
            return AckOutcome::Unmatched;
        }
        self.remove_slot(slot);
        AckOutcome::RolledBack
    }

    /// Reconcile a live broadcast: replace the matching pending entry in
    /// place, otherwise prepend unless the id is already cached (the dedup
    /// guard that makes bus redeliveries and reconnect overlap harmless).
    pub fn apply_broadcast(&mut self, message: MessageBroadcastPayload) -> BroadcastOutcome {
        if self.index.contains_key(&message.id) {
            return BroadcastOutcome::Duplicate;
        }

        let pending_slot = message
            .client_message_id
            .as_deref()
            .and_then(|temp_id| self.index.get(temp_id).copied())
            .filter(|slot| matches!(self.entries.get(slot), Some(CacheEntry::Pending(_))));

        if let Some(slot) = pending_slot {
            if let Some(temp_id) = message.client_message_id.as_deref() {
                self.index.remove(temp_id);
            }
            self.index.insert(message.id.clone(), slot);
            self.entries.insert(slot, CacheEntry::Confirmed(message));
            return BroadcastOutcome::Replaced;
        }

        let slot = self.allocate();
        self.index.insert(message.id.clone(), slot);
        self.entries.insert(slot, CacheEntry::Confirmed(message));
        self.order.push_front(slot);
        BroadcastOutcome::Prepended
    }

    /// Append an older history page at the tail, skipping ids already
    /// cached. Returns how many items were actually added.
    pub fn merge_history_page(&mut self, items: Vec<MessageBroadcastPayload>) -> usize {
        let mut added = 0;
        for item in items {
            if self.index.contains_key(&item.id) {
                continue;
            }
            let slot = self.allocate();
            self.index.insert(item.id.clone(), slot);
            self.entries.insert(slot, CacheEntry::Confirmed(item));
            self.order.push_back(slot);
            added += 1;
        }
        added
    }

    /// Mark the cache stale after a reconnect. Cached data is kept; the
    /// caller must refetch history and call [`MessageCache::resync`], since
    /// no incremental replay exists to fill the gap.
    pub fn begin_resync(&mut self) {
        self.needs_resync = true;
    }

    /// Replace the confirmed view with a fresh history fetch. Pending
    /// entries survive at the head in their original order; confirmed
    /// entries are rebuilt from the server's truth.
    pub fn resync(&mut self, items: Vec<MessageBroadcastPayload>) {
        let pending: Vec<PendingSend> = self
            .order
            .iter()
            .filter_map(|slot| match self.entries.get(slot) {
                Some(CacheEntry::Pending(pending)) => Some(pending.clone()),
                _ => None,
            })
            .collect();

        self.entries.clear();
        self.order.clear();
        self.index.clear();

        // Oldest pending last so the head ends up in original order.
        for entry in pending.into_iter().rev() {
            let slot = self.allocate();
            self.index.insert(entry.temp_id.clone(), slot);
            self.entries.insert(slot, CacheEntry::Pending(entry));
            self.order.push_front(slot);
        }
        self.merge_history_page(items);
        self.needs_resync = false;
    }

    fn allocate(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn remove_slot(&mut self, slot: u64) {
        if let Some(entry) = self.entries.remove(&slot) {
            self.index.remove(entry.cache_id());
        }
        self.order.retain(|candidate| *candidate != slot);
    }
}
