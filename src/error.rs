//! Error handling.
use crate::at;
use crate::error_codes::CmsError;
use crate::sms::MessageEncoding;
use thiserror::Error;

/// Error `enum` for every failure mode this crate can surface.
///
/// Exhaustive matching is NOT guaranteed by the library API: new variants may be added in
/// minor releases.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ModemError {
    /// The background transport task died - every other handle to the modem is now useless.
    #[error("the modem's background I/O task is no longer running")]
    Closed,
    /// An error result code from the modem itself (`ERROR`, `NO CARRIER`, ...).
    #[error("error from modem: {0}")]
    AtError(#[source] at::AtResultCode),
    /// A `+CME ERROR: <n>` result.
    #[error("CME error {code}")]
    Cme {
        /// The numeric CME error code.
        code: u32,
    },
    /// A `+CMS ERROR: <n>` result, decoded into a known variant where possible.
    #[error("CMS error: {0}")]
    Cms(#[source] CmsError),
    /// A `+CMS ERROR: <n>` result with a code this crate doesn't have a name for.
    #[error("unknown CMS error, code {code}")]
    CmsUnknown {
        /// The numeric CMS error code.
        code: u32,
    },
    /// `COMMAND NOT SUPPORT` - the modem doesn't implement the command we issued.
    #[error("command not supported by this modem")]
    CommandNotSupported,
    /// Plain I/O error talking to the serial port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A command timed out waiting for a terminating result code.
    #[error("command timed out after partial response: {partial:?}")]
    Timeout {
        /// Any information responses collected before the timeout fired.
        partial: Vec<String>,
    },
    /// The SIM requires a PIN before any other command will succeed.
    #[error("SIM PIN required")]
    PinRequired,
    /// The PIN that was sent was rejected.
    #[error("incorrect PIN")]
    IncorrectPin,
    /// No SMSC number is configured and none could be read from the SIM.
    #[error("SMSC number unknown")]
    SmscNumberUnknown,
    /// An operation was attempted that doesn't make sense in the current state (e.g. replying
    /// to a USSD session that isn't open).
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A call or DTMF tone was interrupted (CME 3 / CME 30 mid-tone).
    #[error("interrupted: {0}")]
    Interrupted(String),
    /// Failed to encode or decode text for transmission.
    #[error("encoding error")]
    Encoding,
    /// Failed to parse a line or PDU from the modem.
    #[error("parse error")]
    Parse,
    /// A value provided by the modem was of the wrong type.
    #[error("type mismatch when parsing modem response")]
    TypeMismatch,
    /// A value provided by the modem was outside the range this crate understands.
    #[error("value out of range: {0}")]
    ValueOutOfRange(at::AtValue),
    /// An `InformationResponse` was expected but never arrived.
    #[error("expected a {0} response")]
    ExpectedResponse(String),
    /// A PDU failed to parse.
    #[error("invalid PDU: {0}")]
    InvalidPdu(&'static str),
    /// User data used an encoding this crate can't decode.
    #[error("data of unknown encoding {0:?}: {1:?}")]
    UnsupportedEncoding(MessageEncoding, Vec<u8>),
}

impl From<at::AtResultCode> for ModemError {
    fn from(code: at::AtResultCode) -> ModemError {
        match code {
            at::AtResultCode::CmeError(n) => ModemError::Cme { code: n },
            at::AtResultCode::CmsError(e) => ModemError::Cms(e),
            at::AtResultCode::CmsErrorUnknown(n) => ModemError::CmsUnknown { code: n },
            at::AtResultCode::CommandNotSupported => ModemError::CommandNotSupported,
            other => ModemError::AtError(other),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ModemError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> ModemError {
        ModemError::Closed
    }
}

/// Bog-standard result type alias.
pub type ModemResult<T> = Result<T, ModemError>;
