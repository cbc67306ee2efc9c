//! Errors raised while loading or interpreting `lobby.ron`.

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read lobby.ron: {0}")]
    ReadError(#[source] std::io::Error),

    #[error("cannot write lobby.ron: {0}")]
    WriteError(#[source] std::io::Error),

    /// The file exists but is not valid RON for [`crate::Config`].
    #[error("malformed lobby.ron: {0}")]
    ParseError(#[source] ron::error::SpannedError),

    #[error("cannot serialize config: {0}")]
    SerializeError(#[source] ron::Error),

    /// `bind_address` and a port do not form a socket address.
    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    /// A setting is out of range, e.g. a zero-sized outbound queue.
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
