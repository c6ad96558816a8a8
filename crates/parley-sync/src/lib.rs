//! Conversation synchronization and aggregation engine.
//!
//! [`ConversationSync`] owns the active [`ConversationScope`] and the ordered
//! message cache for it; the other modules derive views from that cache
//! (reaction groups, date groups, thread replies) or prepare input for it
//! (mention resolution, channel and membership operations).
//!
//! [`ConversationScope`]: parley_types::models::ConversationScope

pub mod channels;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod mentions;
pub mod messages;
pub mod options;
pub mod partition;
pub mod reactions;
pub mod scope;
pub mod scoped;
pub mod threads;
pub mod view;

pub use conversation::{ConversationSync, ConversationView};
pub use error::{SyncError, SyncResult, ValidationError};
pub use options::SyncOptions;
