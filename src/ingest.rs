//! Ingestion: turns an accepted mail transaction into a store insert.

use std::sync::Arc;

use humansize::{format_size, DECIMAL};
use tracing::{info, warn};

use crate::error::IngestError;
use crate::model::message::{Envelope, MessageId};
use crate::store::MessageStore;

/// Receiver of completed mail transactions.
///
/// This is the seam a protocol server calls into once it has a full
/// envelope and message body. An `Err` must be reported to the client as a
/// temporary failure so it retries; it must not end the server.
pub trait MessageSink: Send + Sync {
    fn on_message_received(
        &self,
        sender: &str,
        recipients: &[String],
        data: Vec<u8>,
    ) -> Result<MessageId, IngestError>;
}

/// [`MessageSink`] that stores every message in a [`MessageStore`].
#[derive(Debug, Clone)]
pub struct IngestAdapter {
    store: Arc<MessageStore>,
}

impl IngestAdapter {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }
}

impl MessageSink for IngestAdapter {
    fn on_message_received(
        &self,
        sender: &str,
        recipients: &[String],
        data: Vec<u8>,
    ) -> Result<MessageId, IngestError> {
        let size = data.len();
        let envelope = Envelope::new(sender, recipients.to_vec())?;

        match self.store.insert(envelope, data) {
            Ok(id) => {
                info!(
                    %id,
                    from = sender,
                    to = ?recipients,
                    size = %format_size(size, DECIMAL),
                    "Received message"
                );
                Ok(id)
            }
            Err(e) => {
                warn!(
                    from = sender,
                    to = ?recipients,
                    size,
                    error = %e,
                    "Error receiving message"
                );
                Err(IngestError::Transient(e))
            }
        }
    }
}
