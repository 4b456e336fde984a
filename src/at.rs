//! Types for dealing with AT commands and replies.
use crate::error::{ModemError, ModemResult};
use crate::error_codes::CmsError;
use std::fmt;

/// An AT result code, which indicates the completion of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtResultCode {
    /// Command executed without failure.
    Ok,
    /// Connection established.
    Connect,
    /// Incoming call.
    Ring,
    /// Connection terminated.
    NoCarrier,
    /// Generic error (rather unhelpful).
    Error,
    /// CME error, with a numeric error code.
    CmeError(u32),
    /// Typed CMS error (SMS-related), decoded into a known code.
    CmsError(CmsError),
    /// CMS error given as a string, because of modem configuration (`AT+CMEE=1`/`2`).
    CmsErrorString(String),
    /// CMS error with a code this crate has no name for.
    CmsErrorUnknown(u32),
    /// No dialtone.
    NoDialtone,
    /// Recipient busy.
    Busy,
    /// No answer (timeout).
    NoAnswer,
    /// Command not supported.
    CommandNotSupported,
    /// Too many parameters.
    TooManyParameters,
}
impl AtResultCode {
    /// Whether this result code represents success.
    pub fn is_ok(&self) -> bool {
        matches!(self, AtResultCode::Ok)
    }
}
impl fmt::Display for AtResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use AtResultCode::*;
        match self {
            Ok => write!(f, "a command is executed, and there is no error"),
            Connect => write!(f, "a connection is established"),
            Ring => write!(f, "an incoming call is originated"),
            NoCarrier => write!(f, "a connection is terminated"),
            Error => write!(f, "a generic error occurred"),
            CmeError(n) => write!(f, "an error occurred: code {}", n),
            CmsError(e) => write!(f, "an SMS-related error occurred: {}", e),
            CmsErrorString(s) => write!(f, "an SMS-related error occurred: {}", s),
            CmsErrorUnknown(n) => write!(f, "an unknown SMS-related error occurred: code {}", n),
            NoDialtone => write!(f, "there is no dialtone"),
            Busy => write!(f, "recipient is busy"),
            NoAnswer => write!(f, "no reply (timeout occurred)"),
            CommandNotSupported => write!(f, "command not supported"),
            TooManyParameters => write!(f, "too many parameters"),
        }
    }
}
/// Any of the set of types that can appear as the value of an AT command or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtValue {
    /// A string-type value - text surrounded by "quotation marks".
    String(String),
    /// An integer.
    Integer(u32),
    /// A range of integers.
    Range((u32, u32)),
    /// Some untyped value - usually a bareword that isn't surrounded in quotation marks.
    Unknown(String),
    /// An empty value, corresponding to nothing at all.
    Empty,
    /// A bracketed array, e.g. `(1,2,3)`.
    BracketedArray(Vec<AtValue>),
    /// A non-bracketed, comma-separated sequence of values.
    Array(Vec<AtValue>),
}
macro_rules! at_value_impl {
    ($atv:ident, $($var:ident, $refmeth:ident, $mutmeth:ident, $asmeth:ident, $ty:ty),*) => {
        /// Accessors to extract the various types out of an `AtValue`, returning
        /// `ModemError::TypeMismatch` if it doesn't hold the expected variant.
        impl $atv {
            $(
                #[allow(missing_docs)]
                pub fn $refmeth(&self) -> ModemResult<&$ty> {
                    if let $atv::$var(ref i) = *self {
                        Ok(i)
                    } else {
                        Err(ModemError::TypeMismatch)
                    }
                }
                #[allow(missing_docs)]
                pub fn $mutmeth(&mut self) -> ModemResult<&mut $ty> {
                    if let $atv::$var(ref mut i) = *self {
                        Ok(i)
                    } else {
                        Err(ModemError::TypeMismatch)
                    }
                }
                #[allow(missing_docs)]
                pub fn $asmeth(self) -> ModemResult<$ty> {
                    if let $atv::$var(i) = self {
                        Ok(i)
                    } else {
                        Err(ModemError::TypeMismatch)
                    }
                }
             )*
        }
    }
}
at_value_impl!(AtValue,
               String, get_string, get_string_mut, as_string, String,
               Integer, get_integer, get_integer_mut, as_integer, u32,
               Range, get_range, get_range_mut, as_range, (u32, u32),
               Unknown, get_unknown, get_unknown_mut, as_unknown, String,
               BracketedArray, get_bracketed_array, get_bracketed_array_mut, as_bracketed_array, Vec<AtValue>,
               Array, get_array, get_array_mut, as_array, Vec<AtValue>);
impl fmt::Display for AtValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use AtValue::*;
        match self {
            String(st) => write!(f, "\"{}\"", st)?,
            Integer(i) => write!(f, "{}", i)?,
            Range((a, b)) => write!(f, "{}-{}", a, b)?,
            Unknown(st) => write!(f, "{}", st)?,
            Empty => {}
            BracketedArray(val) => {
                write!(f, "(")?;
                for (i, val) in val.iter().enumerate() {
                    let c = if i == 0 { "" } else { "," };
                    write!(f, "{}{}", c, val)?;
                }
                write!(f, ")")?;
            }
            Array(val) => {
                for (i, val) in val.iter().enumerate() {
                    let c = if i == 0 { "" } else { "," };
                    write!(f, "{}{}", c, val)?;
                }
            }
        }
        Ok(())
    }
}
/// One of possibly many response lines to an AT command, or an unsolicited one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtResponse {
    /// An information response: `<param>: <response>`.
    InformationResponse { param: String, response: AtValue },
    /// A result code that terminates a command.
    ResultCode(AtResultCode),
    /// Some other unrecognized line.
    Unknown(String),
    /// A pseudo-line emitted by the line framer when the buffer ends with the interactive
    /// `> ` prompt (used by `AT+CMGS` to request the SMS body).
    Prompt,
}
impl AtResponse {
    pub(crate) fn is_result_code(&self) -> bool {
        matches!(self, AtResponse::ResultCode(_))
    }
    pub(crate) fn is_prompt(&self) -> bool {
        matches!(self, AtResponse::Prompt)
    }
}
/// The complete set of responses to one issued AT command.
#[derive(Debug, Clone)]
pub struct AtResponsePacket {
    /// The `InformationResponse`s and `Unknown` lines that were part of this command's expected
    /// reply (anything else was routed to the URC dispatcher instead).
    pub responses: Vec<AtResponse>,
    /// The final result code for this command.
    pub status: AtResultCode,
}
impl AtResponsePacket {
    /// Extracts the value of the first `InformationResponse` whose `param` matches `resp`, if
    /// present. Also asserts the command as a whole succeeded.
    pub fn extract_named_response_opt(&self, resp: &str) -> ModemResult<Option<&AtValue>> {
        self.assert_ok()?;
        for r in self.responses.iter() {
            if let AtResponse::InformationResponse { param, response } = r {
                if resp == param {
                    return Ok(Some(response));
                }
            }
        }
        Ok(None)
    }
    /// Like `extract_named_response_opt`, but fails with `ModemError::ExpectedResponse` if the
    /// named response is missing.
    pub fn extract_named_response(&self, resp: &str) -> ModemResult<&AtValue> {
        match self.extract_named_response_opt(resp)? {
            Some(val) => Ok(val),
            None => Err(ModemError::ExpectedResponse(resp.into())),
        }
    }
    /// Returns `ModemError` (derived from `self.status`) if the status code was not `Ok`.
    pub fn assert_ok(&self) -> ModemResult<()> {
        if self.status.is_ok() {
            Ok(())
        } else {
            Err(ModemError::from(self.status.clone()))
        }
    }
}
impl AtCommand {
    /// Get the set of 'expected' `InformationResponse` names for this command - used to
    /// distinguish the reply to our own command from interleaved URCs.
    pub fn expected(&self) -> Vec<String> {
        match self {
            AtCommand::Equals { param, .. } => vec![param.clone()],
            AtCommand::Execute { command } => vec![command.clone()],
            AtCommand::Read { param } => vec![param.clone()],
            AtCommand::Test { param } => vec![param.clone()],
            AtCommand::Basic { command, .. } => vec![command.clone()],
            AtCommand::Text { expected, .. } => expected.clone(),
        }
    }
}
/// An AT command to send to the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    /// `AT<param>=<value>`
    Equals { param: String, value: AtValue },
    /// `AT<command>`
    Execute { command: String },
    /// `AT<param>?`
    Read { param: String },
    /// `AT<param>=?`
    Test { param: String },
    /// `AT<command>[<number>]`, a basic (non-`+`) command.
    Basic {
        command: String,
        number: Option<usize>,
    },
    /// Raw text, for commands like `AT+CMGS` whose reply requires typing the message body
    /// followed by Ctrl-Z.
    Text {
        text: String,
        /// The set of 'expected' `InformationResponse`s to this command.
        expected: Vec<String>,
    },
}
impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use AtCommand::*;
        match self {
            Equals { param, value } => write!(f, "AT{}={}", param, value)?,
            Execute { command } => write!(f, "AT{}", command)?,
            Read { param } => write!(f, "AT{}?", param)?,
            Test { param } => write!(f, "AT{}=?", param)?,
            Basic { command, number } => {
                write!(f, "AT{}", command)?;
                if let Some(n) = number {
                    write!(f, "{}", n)?;
                }
            }
            Text { text, .. } => write!(f, "{}", text)?,
        }
        Ok(())
    }
}
