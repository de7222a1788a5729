//! Mailbox I/O and the ingestion poller.

pub mod email;
pub mod poller;

pub use email::{EmailConfig, ImapMailbox};
pub use poller::{IngestionPoller, spawn_ingestion_poller};

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::workflow::state::Message;

/// External mailbox: where messages come from and where replies go.
#[async_trait]
pub trait MailboxSource: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `limit` most recent messages, oldest first.
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<Message>, ChannelError>;

    /// Reply to `message` with `draft`.
    async fn send(&self, message: &Message, draft: &str) -> Result<(), ChannelError>;
}
