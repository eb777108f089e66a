pub mod game_client;
pub mod game_server;
pub mod management;

/// Events the role wrappers surface to the application's event loop.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NetEvent {
    ServerConnectionLost { reason: String },
}
