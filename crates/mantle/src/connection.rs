//! The bidirectional message channel between one region and the domain.
//!
//! Grounded on the original `Connection`/`Endpoint`
//! (`include/mantle/connection.h`), which links two `Endpoint`s holding a
//! reference to each other. That's a self-referential pair Rust can't
//! express directly, so here a single [`Connection`] owns both streams and
//! both doorbells directly, and an [`Endpoint`] is a cheap `Arc` handle plus
//! a [`Role`] saying which side of the pair it speaks for; `send`/`receive`
//! pick the right stream and doorbell by matching on the role instead of
//! dereferencing a stored sibling reference.

use crate::doorbell::Doorbell;
use crate::error::MantleError;
use crate::message::Message;
use crate::stream::Stream;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Which side of a [`Connection`] an [`Endpoint`] speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The region's side.
    Client,
    /// The domain's side.
    Server,
}

struct Shared {
    to_server: Stream,
    to_client: Stream,
    server_doorbell: Doorbell,
    client_doorbell: Doorbell,
}

/// Owns both directions of a region-domain message channel.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// # Errors
    /// Returns [`MantleError::SystemCall`] if either doorbell's `eventfd`
    /// cannot be created.
    pub fn new(capacity: usize) -> Result<Self, MantleError> {
        Ok(Self {
            shared: Arc::new(Shared {
                to_server: Stream::new(capacity),
                to_client: Stream::new(capacity),
                server_doorbell: Doorbell::new()?,
                client_doorbell: Doorbell::new()?,
            }),
        })
    }

    /// The region-facing endpoint.
    #[must_use]
    pub fn client_endpoint(&self) -> Endpoint {
        Endpoint { shared: Arc::clone(&self.shared), role: Role::Client, temp_messages: Vec::new() }
    }

    /// The domain-facing endpoint.
    #[must_use]
    pub fn server_endpoint(&self) -> Endpoint {
        Endpoint { shared: Arc::clone(&self.shared), role: Role::Server, temp_messages: Vec::new() }
    }
}

/// One side of a [`Connection`]. Cheap to clone (an `Arc` handle); each side
/// is meant to be owned by exactly one thread.
pub struct Endpoint {
    shared: Arc<Shared>,
    role: Role,
    temp_messages: Vec<Message>,
}

impl Endpoint {
    /// The fd to watch for incoming messages, for a [`crate::selector::Selector`].
    #[must_use]
    pub fn file_descriptor(&self) -> RawFd {
        match self.role {
            Role::Client => self.shared.client_doorbell.file_descriptor(),
            Role::Server => self.shared.server_doorbell.file_descriptor(),
        }
    }

    /// Sends a message to the peer endpoint. Returns `false` if the peer's
    /// inbox stream is full.
    pub fn send_message(&self, message: Message) -> bool {
        let (inbox, doorbell) = match self.role {
            Role::Client => (&self.shared.to_server, &self.shared.server_doorbell),
            Role::Server => (&self.shared.to_client, &self.shared.client_doorbell),
        };
        if !inbox.send(message) {
            return false;
        }
        doorbell.ring(1);
        true
    }

    /// Polls this endpoint's doorbell, then drains and returns every
    /// message addressed to it.
    pub fn receive_messages(&mut self, non_blocking: bool) -> Vec<Message> {
        let (inbox, doorbell) = match self.role {
            Role::Client => (&self.shared.to_client, &self.shared.client_doorbell),
            Role::Server => (&self.shared.to_server, &self.shared.server_doorbell),
        };
        doorbell.poll(non_blocking);

        self.temp_messages.clear();
        inbox.receive_into(&mut self.temp_messages);
        std::mem::take(&mut self.temp_messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_send_wakes_server() {
        let connection = Connection::new(8).unwrap();
        let client = connection.client_endpoint();
        let mut server = connection.server_endpoint();

        assert!(client.send_message(Message::Start));
        let received = server.receive_messages(true);
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0], Message::Start));
    }

    #[test]
    fn server_send_wakes_client() {
        let connection = Connection::new(8).unwrap();
        let mut client = connection.client_endpoint();
        let server = connection.server_endpoint();

        assert!(server.send_message(Message::Leave { stop: true }));
        let received = client.receive_messages(true);
        assert_eq!(received.len(), 1);
    }
}
