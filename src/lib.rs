//! An async driver for Hayes-command ("AT command") GSM/UMTS modems, speaking 3GPP TS 27.007
//! over a serial line and decoding/encoding SMS as 3GPP TS 23.040 PDUs.
//!
//! The entry point is [`session::Modem::connect`] (or [`session::Modem::connect_serial`], which
//! opens the port itself via `tokio_serial`); `connect` takes any `AsyncRead + AsyncWrite` byte
//! stream, which is all this crate requires of the transport.
pub mod at;
pub mod call;
pub mod codec;
pub mod dialect;
pub mod error;
pub mod error_codes;
pub mod parse;
pub mod probe;
pub mod session;
pub mod sms;
pub mod transport;
pub mod urc;
pub mod ussd;

pub use error::{ModemError, ModemResult};
pub use session::{Modem, ModemConfig};
