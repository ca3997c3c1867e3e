use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Error returned from database"))]
    Storage {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Failed to encode or decode message content"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Failed to initialize table {table}"))]
    Schema {
        table: String,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Operation cancelled"))]
    Cancelled,

    #[snafu(display("Invalid configuration"))]
    Config {
        #[snafu(source)]
        source: envy::Error,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Storage { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<envy::Error> for Error {
    fn from(source: envy::Error) -> Self {
        Self::Config { source }
    }
}

impl Error {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Whether the scheduler may try the same call again later.
    ///
    /// Only storage failures qualify: a lost connection or a busy database
    /// can clear up on its own, malformed input cannot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}
