//! AI conversation model.
//!
//! The chat providers themselves live outside this crate; what lives here
//! is the conversation data model, the context-trimming algorithm that
//! keeps long histories inside a provider's window by summarizing old
//! shot messages, and the persistence index that lists saved
//! conversations without deserializing their message bodies.

pub mod context;
pub mod conversation;
pub mod store;

pub use context::{MAX_VERBATIM_PAIRS, summarize_advice, summarize_shot_message, trim_history};
pub use conversation::{Conversation, Message, Role};
pub use store::{ConversationIndexEntry, ConversationStore};
