use mio::{event::Event, Token};
use std::fmt;

/// Owned snapshot of one readiness event, detached from the `Events` buffer
/// so the loop can mutate itself while dispatching.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    token: Token,
    is_readable: bool,
    is_writable: bool,
    is_closed: bool,
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("token", &self.token)
            .field("is_readable", &self.is_readable)
            .field("is_writable", &self.is_writable)
            .field("is_closed", &self.is_closed)
            .finish()
    }
}

impl Readiness {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }

    /// Peer hung up or the socket reported an error. The read handler still
    /// runs so buffered bytes and the EOF are observed through `read`.
    pub fn is_closed(&self) -> bool {
        self.is_closed
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_writable: event.is_writable(),
            is_closed: event.is_read_closed() || event.is_error(),
        }
    }
}
