use crate::domain::models::DeviceId;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the radio driver, the protocol session layer and the
/// orchestrator itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("device {0} is not in the discovery cache")]
    UnknownDevice(DeviceId),

    #[error("radio is not available")]
    RadioUnavailable,

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),

    #[error("service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("device did not advertise service data")]
    MissingServiceData,

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        assert_eq!(
            BleError::UnknownDevice(id).to_string(),
            "device 00000000-0000-0000-0000-000000000000 is not in the discovery cache"
        );

        let err = BleError::RetriesExhausted {
            operation: "connect",
            attempts: 10,
        };
        assert_eq!(err.to_string(), "connect failed after 10 attempts");

        assert_eq!(
            BleError::ConnectionFailed("timeout".to_string()).to_string(),
            "connection failed: timeout"
        );
    }
}
