//! Poll token layout.
//!
//! Connection tokens are the connection's slab key, so they grow upward from
//! zero. The listener and the cross-thread waker take the two highest token
//! values, which the slab can never reach.

use mio::Token;

/// Readiness of the listening socket.
pub const LISTENER: Token = Token(usize::MAX);

/// Wake-ups from compile workers and shutdown requests.
pub const WAKER: Token = Token(usize::MAX - 1);

/// What a poll token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Listener,
    Waker,
    Connection(usize),
}

impl Source {
    pub fn of(token: Token) -> Self {
        match token {
            LISTENER => Source::Listener,
            WAKER => Source::Waker,
            Token(conn_id) => Source::Connection(conn_id),
        }
    }
}

/// Token for a connection id.
pub fn connection(conn_id: usize) -> Token {
    debug_assert!(conn_id < WAKER.0, "connection id collides with reserved tokens");
    Token(conn_id)
}
