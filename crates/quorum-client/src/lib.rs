#![forbid(unsafe_code)]

//! Client-side reconciliation for the quorum gateway: an ordered,
//! id-deduplicated message cache with optimistic sends, plus ephemeral
//! typing-indicator tracking. Everything here is pure state: no sockets,
//! no timers, time is always passed in by the caller.

mod cache;
mod typing;

pub use cache::{
    AckOutcome, BroadcastOutcome, CacheEntry, CacheError, MessageCache, PendingSend,
};
pub use typing::{TypingTracker, DEFAULT_TYPING_TIMEOUT_MS};
