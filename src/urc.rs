//! URC Dispatcher (spec §4.C): turns the raw unsolicited-response stream coming out of the
//! transport into a structured event fed to the session event loop.
//!
//! Grounded on the teacher's approach of matching unsolicited lines by information-response
//! parameter name (`+CMTI`, `+CDSI`, ...), generalized with [`crate::dialect`]'s per-vendor
//! call-state tables for the lines that aren't named `+`-parameters at all (`^ORIG`, `RING`,
//! `CONNECT`, ...).
use crate::at::{AtResponse, AtResultCode};
use crate::dialect::{CallUrc, Dialect};
use crate::sms::{parse_new_message_notification, NewMessageNotification};
use tracing::trace;

/// One dispatched unsolicited event. Never blocks the caller (spec §4.C invariant) - building
/// one of these is pure parsing; any I/O the handler needs (e.g. fetching a stored SMS after
/// a `+CMTI`) happens after dispatch, back through the transport.
#[derive(Debug, Clone)]
pub enum UrcEvent {
    /// Incoming call ring (basic `RING` result code).
    Ring,
    /// `+CLIP: "<number>",<type>` caller-ID line accompanying a `RING`.
    Clip { number: String },
    /// New SMS arrived in storage, notified directly (`+CMTI`).
    NewSms(NewMessageNotification),
    /// New status report arrived in storage, notified indirectly (`+CDSI`).
    NewStatusReport(NewMessageNotification),
    /// A status report delivered inline, as hex PDU text (`+CDS`).
    StatusReportPdu(String),
    /// `+CUSD: <n>,"<msg>",<dcs>` USSD response/notification.
    Ussd { n: u32, message: Option<String>, dcs: Option<u32> },
    /// In-band DTMF tone detected (SIMCom `^DTMF`/`+DTMF` style dialects).
    Dtmf { tone: char },
    /// A call lifecycle transition, already resolved through the active dialect's table.
    Call(CallUrc),
    /// Recognized but not acted upon - kept for diagnostics.
    Other(String),
}

/// Stateful wrapper around [`dispatch_line`] that carries the one piece of state URC parsing
/// needs across lines: a `+CDS:<len>` announcement doesn't carry the status-report PDU itself
/// (per spec §4.C / `original_source`'s `modem.py:1224-1233`) - the hex TPDU arrives as the
/// *following* raw line, with only its length given up front. One parser instance must be
/// reused across the whole URC stream so that carry-over survives between calls.
#[derive(Debug, Default)]
pub struct UrcParser {
    expecting_cds_pdu: bool,
}

impl UrcParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line emitted by the transport's URC channel into a structured event, or
    /// `None` if the line was consumed as half of a multi-line sequence (so far, only
    /// `+CDS:<len>`) with nothing to report yet.
    pub fn dispatch(&mut self, line: AtResponse, dialect: Option<Dialect>) -> Option<UrcEvent> {
        if self.expecting_cds_pdu {
            self.expecting_cds_pdu = false;
            if let AtResponse::Unknown(hex) = &line {
                return Some(UrcEvent::StatusReportPdu(hex.clone()));
            }
            // Not the line we expected - fall through and parse it normally instead of
            // silently dropping it.
        }
        if let AtResponse::InformationResponse { param, response } = &line {
            if param == "+CDS" {
                self.expecting_cds_pdu = true;
                return None;
            }
        }
        Some(dispatch_line(line, dialect))
    }
}

/// Parse one line emitted by the transport's URC channel into a structured event, with no
/// memory of prior lines. Use [`UrcParser`] instead when `+CDS` (or any other future
/// multi-line URC) needs to be recognized correctly.
///
/// `dialect` is `None` before capability probing completes (lines arriving that early are rare
/// but possible on some modems that chirp before the first `ATZ` reply); call-state URCs are
/// simply not recognized yet in that case.
fn dispatch_line(line: AtResponse, dialect: Option<Dialect>) -> UrcEvent {
    if let Some(d) = dialect {
        if let Some(call) = d.match_call_urc(&line) {
            return UrcEvent::Call(call);
        }
    }
    match &line {
        AtResponse::ResultCode(AtResultCode::Ring) => UrcEvent::Ring,
        AtResponse::InformationResponse { param, response } => match param.as_str() {
            "+CLIP" => response
                .get_array()
                .ok()
                .and_then(|a| a.first().cloned())
                .and_then(|v| v.get_string().ok().cloned())
                .map(|number| UrcEvent::Clip { number })
                .unwrap_or_else(|| UrcEvent::Other(format!("{}: {}", param, response))),
            "+CMTI" => parse_new_message_notification(response)
                .map(UrcEvent::NewSms)
                .unwrap_or_else(|_| UrcEvent::Other(format!("{}: {}", param, response))),
            "+CDSI" => parse_new_message_notification(response)
                .map(UrcEvent::NewStatusReport)
                .unwrap_or_else(|_| UrcEvent::Other(format!("{}: {}", param, response))),
            "+CUSD" => parse_cusd(response),
            "+DTMF" => response
                .get_string()
                .ok()
                .or_else(|| response.get_unknown().ok())
                .and_then(|s| s.chars().next())
                .map(|tone| UrcEvent::Dtmf { tone })
                .unwrap_or_else(|| UrcEvent::Other(format!("{}: {}", param, response))),
            _ => UrcEvent::Other(format!("{}: {}", param, response)),
        },
        AtResponse::Unknown(s) if s.starts_with('^') && s.contains("DTMF") => s
            .splitn(2, ':')
            .nth(1)
            .and_then(|rest| rest.split(',').next())
            .and_then(|t| t.trim().chars().next())
            .map(|tone| UrcEvent::Dtmf { tone })
            .unwrap_or_else(|| UrcEvent::Other(s.clone())),
        AtResponse::Unknown(s) => {
            trace!(line = %s, "unrecognized URC line");
            UrcEvent::Other(s.clone())
        }
        other => UrcEvent::Other(format!("{:?}", other)),
    }
}

fn parse_cusd(response: &crate::at::AtValue) -> UrcEvent {
    let arr = match response.get_array() {
        Ok(a) => a.clone(),
        Err(_) => vec![response.clone()],
    };
    let n = arr
        .first()
        .and_then(|v| v.get_integer().ok())
        .copied()
        .unwrap_or(0);
    let message = arr.get(1).and_then(|v| v.get_string().ok()).cloned();
    let dcs = arr.get(2).and_then(|v| v.get_integer().ok()).copied();
    UrcEvent::Ussd { n, message, dcs }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::at::AtValue;

    #[test]
    fn cmti_dispatches_to_new_sms() {
        let line = AtResponse::InformationResponse {
            param: "+CMTI".into(),
            response: AtValue::Array(vec![AtValue::String("SM".into()), AtValue::Integer(3)]),
        };
        match UrcParser::new().dispatch(line, None).unwrap() {
            UrcEvent::NewSms(n) => assert_eq!(n.index, 3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn ring_result_code_dispatches() {
        let line = AtResponse::ResultCode(AtResultCode::Ring);
        assert!(matches!(UrcParser::new().dispatch(line, None), Some(UrcEvent::Ring)));
    }

    #[test]
    fn cusd_parses_n_and_message() {
        let line = AtResponse::InformationResponse {
            param: "+CUSD".into(),
            response: AtValue::Array(vec![AtValue::Integer(2), AtValue::String("done".into())]),
        };
        match UrcParser::new().dispatch(line, None).unwrap() {
            UrcEvent::Ussd { n, message, .. } => {
                assert_eq!(n, 2);
                assert_eq!(message.as_deref(), Some("done"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn huawei_call_urc_dispatches_via_dialect() {
        let line = AtResponse::Unknown("^ORIG:1,0".into());
        match UrcParser::new().dispatch(line, Some(Dialect::Huawei)).unwrap() {
            UrcEvent::Call(CallUrc::Initiated { id, .. }) => assert_eq!(id, 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn cds_length_line_then_pdu_line_yields_status_report_pdu() {
        let mut parser = UrcParser::new();
        let length_line = AtResponse::InformationResponse {
            param: "+CDS".into(),
            response: AtValue::Integer(28),
        };
        assert!(parser.dispatch(length_line, None).is_none());
        let pdu_line = AtResponse::Unknown("0791447758100650040C914497700654450008".into());
        match parser.dispatch(pdu_line.clone(), None).unwrap() {
            UrcEvent::StatusReportPdu(hex) => assert_eq!(hex, "0791447758100650040C914497700654450008"),
            other => panic!("unexpected: {:?}", other),
        }
        // state must not leak into the next line
        assert!(!parser.expecting_cds_pdu);
    }
}
