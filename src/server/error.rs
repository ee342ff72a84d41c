//! Worker server error types.

/// Errors that end a worker's serving loop.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The configured host does not resolve to a socket address.
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// The server failed while serving.
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}
