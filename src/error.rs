//! Error types for iSCSI initiator operations

use thiserror::Error;

/// iSCSI initiator errors
///
/// Protocol-shape violations found by a validator are not errors; they are
/// recorded in a [`crate::interceptor::ValidationReport`].
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Login rejected (class=0x{class:02x}, detail=0x{detail:02x}): {message}")]
    Login {
        class: u8,
        detail: u8,
        message: String,
    },
}

impl IscsiError {
    /// Build a login error with the decoded status text
    pub fn login(class: u8, detail: u8) -> Self {
        IscsiError::Login {
            class,
            detail,
            message: decode_login_status(class, detail),
        }
    }
}

/// Result type for iSCSI/SCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;

/// Turn a Login Response status class/detail pair (RFC 3720 10.13.5) into
/// text a person running the suite can act on.
pub fn decode_login_status(class: u8, detail: u8) -> String {
    match (class, detail) {
        (0x00, _) => "Login success".to_string(),
        (0x01, 0x01) => {
            "Target moved temporarily; retry against the portal in TargetAddress".to_string()
        }
        (0x01, 0x02) => {
            "Target moved permanently; update the portal in the configuration".to_string()
        }
        (0x01, _) => "Target redirected the login".to_string(),
        (0x02, 0x00) => "Initiator error (unspecified)".to_string(),
        (0x02, 0x01) => "Authentication failed; this suite only offers AuthMethod=None".to_string(),
        (0x02, 0x02) => {
            "Authorization failure; check the target ACL allows this initiator name".to_string()
        }
        (0x02, 0x03) => {
            "Target not found; check the target name in the configuration".to_string()
        }
        (0x02, 0x04) => "Target removed".to_string(),
        (0x02, 0x05) => "Unsupported iSCSI version".to_string(),
        (0x02, 0x06) => "Too many connections on this session".to_string(),
        (0x02, 0x07) => {
            "Missing parameter; InitiatorName and TargetName are required".to_string()
        }
        (0x02, 0x08) => "Cannot include this connection in the session".to_string(),
        (0x02, 0x09) => "Session type not supported".to_string(),
        (0x02, 0x0A) => "Session does not exist".to_string(),
        (0x02, 0x0B) => "Invalid request during login".to_string(),
        (0x03, 0x00) => "Target error (unspecified)".to_string(),
        (0x03, 0x01) => "Service unavailable; wait and retry the login".to_string(),
        (0x03, 0x02) => "Target is out of resources".to_string(),
        _ => format!(
            "Unknown login status class=0x{:02x} detail=0x{:02x} (see RFC 3720 10.13.5)",
            class, detail
        ),
    }
}
