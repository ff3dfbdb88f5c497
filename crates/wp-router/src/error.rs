//! Router Error Types

use thiserror::Error;
use uuid::Uuid;
use wp_common::RoutingError;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// The message was saved but could not be dispatched. The router has
    /// already terminated it, so it will not linger as pending.
    #[error("Failed to dispatch message {message_id}: {source}")]
    Dispatch {
        message_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("Router is canceled")]
    Canceled,

    #[error("Router is disposed")]
    Disposed,

    #[error("Message {message_id} was never saved")]
    NotSaved { message_id: Uuid },

    #[error("Message {message_id} is already delivered")]
    AlreadyDelivered { message_id: Uuid },

    #[error("Repository error: {0}")]
    Repository(#[source] anyhow::Error),
}

impl RouterError {
    /// The domain error behind this failure, if there is one.
    pub fn routing_error(&self) -> Option<&RoutingError> {
        match self {
            Self::Routing(error) => Some(error),
            Self::Dispatch { source, .. } => source.downcast_ref::<RoutingError>(),
            _ => None,
        }
    }
}
