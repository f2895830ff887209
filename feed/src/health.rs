/// Lifecycle state of the live data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ConnectionState::Disconnected => "OFFLINE",
                ConnectionState::Connecting => "CONNECTING",
                ConnectionState::Connected => "LIVE",
                ConnectionState::Reconnecting => "RECONNECTING",
            }
        )
    }
}
