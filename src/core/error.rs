use thiserror::Error;

#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Provider not found for role {role}: {reason}")]
    ProviderNotFound { role: String, reason: String },

    #[error("Role already registered: {0}")]
    DuplicateRole(String),

    #[error("Instance {index} out of range for role {role} ({count} instances)")]
    InstanceOutOfRange {
        role: String,
        index: usize,
        count: usize,
    },

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Remote delivery to {peer} failed: {reason}")]
    RemoteDelivery { peer: String, reason: String },

    #[error("Flush write failed for {model}: {reason}")]
    FlushWrite { model: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Buffer full: cannot store more items")]
    BufferFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Envelope encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Result type alias for Kestrel operations
pub type Result<T> = std::result::Result<T, KestrelError>;

impl KestrelError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new handler error
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Self::Handler(msg.into())
    }

    /// Creates a new remote delivery error
    pub fn remote<P: Into<String>, S: Into<String>>(peer: P, reason: S) -> Self {
        Self::RemoteDelivery {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new flush write error
    pub fn flush_write<M: Into<String>, S: Into<String>>(model: M, reason: S) -> Self {
        Self::FlushWrite {
            model: model.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new unsupported operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Handler(_)
                | Self::RemoteDelivery { .. }
                | Self::FlushWrite { .. }
                | Self::Storage(_)
                | Self::BufferFull
        )
    }

    /// Returns true if this error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::RoleNotFound(_)
                | Self::ProviderNotFound { .. }
                | Self::DuplicateRole(_)
        )
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::DuplicateRole(_) => "config",
            Self::RoleNotFound(_) | Self::ProviderNotFound { .. } => "lookup",
            Self::InstanceOutOfRange { .. } => "routing",
            Self::Handler(_) => "handler",
            Self::RemoteDelivery { .. } => "remote",
            Self::FlushWrite { .. } | Self::Storage(_) => "storage",
            Self::Unsupported(_) => "unsupported",
            Self::InvalidRecord(_) => "validation",
            Self::ChannelClosed | Self::BufferFull => "channel",
            Self::Io(_) => "io",
            Self::Serialization(_) | Self::Yaml(_) | Self::Encoding(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = KestrelError::config("test message");
        assert_eq!(err.to_string(), "Configuration error: test message");
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_error_recoverability() {
        assert!(KestrelError::remote("10.0.0.2:11800", "connection reset").is_recoverable());
        assert!(KestrelError::flush_write("service_relation", "timeout").is_recoverable());
        assert!(!KestrelError::config("invalid config").is_recoverable());
    }

    #[test]
    fn test_lookup_errors_are_fatal() {
        let err = KestrelError::RoleNotFound("metrics_persistence".to_string());
        assert!(err.is_fatal());
        assert_eq!(err.category(), "lookup");
        assert_eq!(err.to_string(), "Role not found: metrics_persistence");
        assert!(!KestrelError::BufferFull.is_fatal());
    }

    #[test]
    fn test_instance_out_of_range_message() {
        let err = KestrelError::InstanceOutOfRange {
            role: "agg".to_string(),
            index: 4,
            count: 3,
        };
        assert_eq!(err.to_string(), "Instance 4 out of range for role agg (3 instances)");
    }
}
