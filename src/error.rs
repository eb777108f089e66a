use std::fmt::{Display, Formatter};

/// The channel a transport-level error occurred on, for diagnostics.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Channel {
    Tcp,
    Udp,
    Platform,
    Management,
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Tcp => write!(f, "tcp"),
            Channel::Udp => write!(f, "udp"),
            Channel::Platform => write!(f, "platform"),
            Channel::Management => write!(f, "management"),
        }
    }
}

/// Errors surfaced by connections. Background tasks never panic across the
///  thread boundary: they append these as values to the owning connection's
///  error queue, and the application thread drains them once per tick via
///  `handle_errors`, disposing the affected connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The process-wide connection id pool is empty. Fatal at construction time.
    #[error("connection id pool exhausted ({0} live connections)")]
    IdPoolExhausted(usize),

    #[error("i/o error on {channel} channel: {source}")]
    Io {
        channel: Channel,
        #[source]
        source: std::io::Error,
    },

    /// Stream framing cannot recover byte alignment after an invalid header, so
    ///  this is fatal for the connection.
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    #[error("malformed {0} control message")]
    MalformedControl(&'static str),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("platform send failed with error code {0}")]
    Platform(i32),
}
