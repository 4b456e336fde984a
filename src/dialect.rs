//! Vendor dialect selection (spec §4.D step 7) and the per-dialect call-URC/DTMF tables that
//! replace what would otherwise be an inheritance hierarchy (spec §9 "dialect dispatch").
use crate::at::AtResponse;
use regex::Regex;
use std::sync::OnceLock;

/// The detected modem vendor dialect. Chosen once during capability probing and immutable
/// thereafter (spec §3 "Capabilities... Immutable after probe").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Huawei,
    Wavecom,
    Zte,
    SimCom,
    Generic,
}

/// A lifecycle transition reported by a dialect's call-state URC table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallUrc {
    /// Call initiated (outgoing), or the terminal of an incoming call setup.
    Initiated { id: u32, call_type: u32 },
    /// Call answered.
    Answered { id: Option<u32> },
    /// Call ended (includes rejection for dialects with no distinct signal).
    Ended { id: Option<u32> },
}

/// The inputs considered by dialect detection - gathered during the capability-probe
/// sequence (spec §4.D step 7).
#[derive(Debug, Clone, Default)]
pub struct DialectSignals {
    pub manufacturer: String,
    pub has_clac: bool,
    pub has_dtmf_caret: bool,
    pub has_wind: bool,
    pub has_zpas: bool,
    pub zpas_query_ok: bool,
    pub seen_orig_style: bool,
}

impl DialectSignals {
    fn manufacturer_is(&self, name: &str) -> bool {
        self.manufacturer.to_lowercase().contains(name)
    }
}

/// Resolve the dialect from probe signals.
///
/// Open Question (a) from spec §9: the Python source checks SIMCom and Huawei in the same
/// `if`/`elif` chain, in an order where SIMCom is tested first and, when it matches, never
/// falls through to the Huawei branch - it enables `^DTMF`/`AT+DDET=1` support but leaves the
/// call-state table at the `Generic` (CLCC-polling) default. This function implements that
/// precedence literally: SIMCom is checked before Huawei, and a SIMCom match short-circuits.
pub fn detect(signals: &DialectSignals) -> Dialect {
    if signals.has_dtmf_caret && !signals.has_clac && signals.manufacturer_is("simcom") {
        return Dialect::Generic;
    }
    if signals.manufacturer_is("huawei") || signals.seen_orig_style {
        return Dialect::Huawei;
    }
    if signals.has_wind {
        return Dialect::Wavecom;
    }
    if signals.has_zpas || signals.zpas_query_ok {
        return Dialect::Zte;
    }
    Dialect::Generic
}

/// Whether this dialect additionally enables SIMCom-style in-band DTMF detection
/// (`AT+DDET=1`) during probing, independent of its call-state table choice.
pub fn enables_simcom_dtmf(signals: &DialectSignals) -> bool {
    signals.has_dtmf_caret && !signals.has_clac && signals.manufacturer_is("simcom")
}

impl Dialect {
    /// Whether `dial()` should arm a "call initiated" URC waiter (Huawei/SIMCom-as-Generic
    /// style dialects that emit one) as opposed to polling `AT+CLCC` (true Generic).
    pub fn has_initiated_urc(&self) -> bool {
        !matches!(self, Dialect::Generic)
    }

    /// Whether `ATD` itself only returns `OK` once the call is *answered* (Wavecom, ZTE),
    /// rather than immediately upon dialing.
    pub fn atd_ok_means_answered(&self) -> bool {
        matches!(self, Dialect::Wavecom | Dialect::Zte)
    }

    /// The AT command template used to send a DTMF tone while a call is active.
    pub fn dtmf_command(&self, call_id: u32, tone: char) -> String {
        match self {
            Dialect::Huawei => format!("^DTMF={},{}", call_id, tone),
            _ => format!("+VTS={}", tone),
        }
    }

    /// Attempt to interpret one URC line as a call-state transition for this dialect.
    pub fn match_call_urc(&self, line: &AtResponse) -> Option<CallUrc> {
        let text = match line {
            AtResponse::Unknown(s) => s.as_str(),
            AtResponse::InformationResponse { param, response } => {
                return self.match_information_call_urc(param, response);
            }
            _ => return None,
        };
        match self {
            Dialect::Huawei => huawei_regexes().captures_call(text),
            Dialect::Wavecom => wavecom_regexes().captures_call(text),
            Dialect::Zte => zte_regexes().captures_call(text),
            Dialect::SimCom | Dialect::Generic => None,
        }
    }

    fn match_information_call_urc(&self, param: &str, response: &crate::at::AtValue) -> Option<CallUrc> {
        if *self != Dialect::Wavecom || param != "+WIND" {
            return None;
        }
        let arr = response.get_array().ok()?;
        let code = arr.first()?.get_integer().ok().copied()?;
        let id = arr.get(1).and_then(|v| v.get_integer().ok()).copied();
        match code {
            5 => Some(CallUrc::Initiated {
                id: id.unwrap_or(0),
                call_type: 0,
            }),
            6 => Some(CallUrc::Ended { id }),
            _ => None,
        }
    }
}

struct CallRegexes {
    initiated: Regex,
    connected: Regex,
    ended: Regex,
}
impl CallRegexes {
    fn captures_call(&self, text: &str) -> Option<CallUrc> {
        if let Some(c) = self.initiated.captures(text) {
            let id: u32 = c.get(1)?.as_str().parse().ok()?;
            let call_type: u32 = c.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            return Some(CallUrc::Initiated { id, call_type });
        }
        if self.connected.is_match(text) {
            let id = self
                .connected
                .captures(text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok());
            return Some(CallUrc::Answered { id });
        }
        if let Some(c) = self.ended.captures(text) {
            let id = c.get(1).and_then(|m| m.as_str().parse().ok());
            return Some(CallUrc::Ended { id });
        }
        None
    }
}

fn huawei_regexes() -> &'static CallRegexes {
    static CELL: OnceLock<CallRegexes> = OnceLock::new();
    CELL.get_or_init(|| CallRegexes {
        initiated: Regex::new(r"^\^ORIG:(\d+),(\d+)").unwrap(),
        connected: Regex::new(r"^\^CONN:(\d+)").unwrap(),
        ended: Regex::new(r"^\^CEND:(\d+)").unwrap(),
    })
}
fn wavecom_regexes() -> &'static CallRegexes {
    static CELL: OnceLock<CallRegexes> = OnceLock::new();
    // Wavecom's +WIND lines are handled via match_information_call_urc; this table is kept
    // for symmetry and future bareword variants some firmware revisions emit as plain text.
    CELL.get_or_init(|| CallRegexes {
        initiated: Regex::new(r"^\+WIND: 5,(\d+)()").unwrap(),
        connected: Regex::new(r"^OK$").unwrap(),
        ended: Regex::new(r"^\+WIND: 6,(\d+)").unwrap(),
    })
}
fn zte_regexes() -> &'static CallRegexes {
    static CELL: OnceLock<CallRegexes> = OnceLock::new();
    CELL.get_or_init(|| CallRegexes {
        initiated: Regex::new(r"(?!x)x").unwrap(), // ZTE has no "initiated" URC.
        connected: Regex::new(r"^CONNECT$").unwrap(),
        ended: Regex::new(r"^HANGUP:(\d+)").unwrap(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn simcom_takes_precedence_over_huawei() {
        let signals = DialectSignals {
            manufacturer: "SIMCOM_Ltd".into(),
            has_clac: false,
            has_dtmf_caret: true,
            ..Default::default()
        };
        assert_eq!(detect(&signals), Dialect::Generic);
        assert!(enables_simcom_dtmf(&signals));
    }

    #[test]
    fn huawei_detected_by_manufacturer() {
        let signals = DialectSignals {
            manufacturer: "huawei".into(),
            has_clac: true,
            ..Default::default()
        };
        assert_eq!(detect(&signals), Dialect::Huawei);
    }

    #[test]
    fn wavecom_by_wind() {
        let signals = DialectSignals {
            has_wind: true,
            ..Default::default()
        };
        assert_eq!(detect(&signals), Dialect::Wavecom);
    }

    #[test]
    fn zte_by_zpas() {
        let signals = DialectSignals {
            has_zpas: true,
            ..Default::default()
        };
        assert_eq!(detect(&signals), Dialect::Zte);
    }

    #[test]
    fn huawei_call_urcs_parse() {
        let d = Dialect::Huawei;
        assert_eq!(
            d.match_call_urc(&AtResponse::Unknown("^ORIG:1,0".into())),
            Some(CallUrc::Initiated { id: 1, call_type: 0 })
        );
        assert_eq!(
            d.match_call_urc(&AtResponse::Unknown("^CONN:1,0".into())),
            Some(CallUrc::Answered { id: Some(1) })
        );
        assert_eq!(
            d.match_call_urc(&AtResponse::Unknown("^CEND:1,0,10,16".into())),
            Some(CallUrc::Ended { id: Some(1) })
        );
    }
}
