use shared::domain::{ConversationId, MessageId};
use thiserror::Error;

use crate::request_cache::CacheError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no signed-in identity to send as")]
    MissingIdentity,
    #[error("message content and attachments are both empty")]
    EmptyMessage,
    #[error("failed to load history for conversation {conversation_id}: {source}")]
    History {
        conversation_id: ConversationId,
        source: CacheError,
    },
    #[error("failed to send message {temp_id}: {source}")]
    Send { temp_id: MessageId, source: CacheError },
    #[error("durable store rejected message {temp_id}")]
    Rejected { temp_id: MessageId },
}
