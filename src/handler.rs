use crate::{connection::Connection, error::Error, server::ServerInfo};

/// What the engine should do after a hook returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Action {
    #[default]
    None,
    /// Close this connection once its queued writes are flushed.
    Close,
    /// Stop the whole server.
    Shutdown,
}

/// Application logic driven by the event loops.
///
/// Every hook runs on the loop thread that owns the connection, so
/// implementations must be thread-safe (`Send + Sync`) and should not block:
/// a slow hook stalls every other connection on that loop. Hand long work to
/// a [`WorkerPool`](crate::thread_pool::WorkerPool) and reply later through
/// [`Connection::handle`].
///
/// Only [`react`](Self::react) is required.
pub trait EventHandler: Send + Sync + 'static {
    type Frame: Send + 'static;

    /// Called once the listener is bound and the loops are about to start.
    fn on_init_complete(&self, server: &ServerInfo) -> Action {
        let _ = server;
        Action::None
    }

    /// Called on the owning loop after the connection has been registered.
    fn on_opened(&self, conn: &mut Connection<Self::Frame>) -> Action {
        let _ = conn;
        Action::None
    }

    /// Called exactly once per opened connection. `error` is `None` for a
    /// clean close (peer hung up between frames, `Action::Close`, shutdown).
    fn on_closed(&self, conn: &mut Connection<Self::Frame>, error: Option<&Error>) -> Action {
        let _ = (conn, error);
        Action::None
    }

    /// Called once per decoded frame, in arrival order. A returned frame is
    /// encoded and queued for writing before the action is applied.
    fn react(
        &self,
        frame: Self::Frame,
        conn: &mut Connection<Self::Frame>,
    ) -> (Option<Self::Frame>, Action);

    /// Called after every loop has stopped.
    fn on_shutdown(&self, server: &ServerInfo) {
        let _ = server;
    }
}
