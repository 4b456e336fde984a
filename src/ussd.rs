//! USSD Session (spec §4.G): a single in-flight session slot, completing either inline (the
//! `AT+CUSD` command's own response) or later via a `+CUSD` URC. Per 3GPP TS 27.007 `<n>`:
//! `1` means further user action is required and the session stays open; `0` ("no further
//! action required") and `2` ("USSD terminated by network") both release it.
use crate::at::{AtCommand, AtValue};
use crate::error::{ModemError, ModemResult};
use crate::transport::AtTransport;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

const USSD_TIMEOUT: Duration = Duration::from_secs(30);

/// The outcome of a USSD exchange.
#[derive(Debug, Clone)]
pub struct UssdResponse {
    pub message: Option<String>,
    /// Whether the session is now closed (`n != 1`) - if `false`, a reply can still be sent
    /// with [`reply`].
    pub session_released: bool,
}

/// The single outstanding USSD waiter, if any. Spec §4.G: "at most one USSD session may be
/// in flight at a time"; a second `send_ussd` while one is pending is a caller error, not
/// something this module arbitrates - callers serialize through the session's event loop.
pub struct UssdSession {
    waiter: Option<oneshot::Sender<UssdResponse>>,
}

impl Default for UssdSession {
    fn default() -> Self {
        Self { waiter: None }
    }
}

impl UssdSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a USSD exchange is currently awaiting its URC-delivered completion.
    pub fn is_pending(&self) -> bool {
        self.waiter.is_some()
    }

    /// Feed a dispatched `+CUSD` URC into the pending waiter, if any. Returns the resolved
    /// response if this URC completed an open session (it always does - there is no "partial"
    /// `+CUSD`).
    pub fn handle_cusd_urc(&mut self, n: u32, message: Option<String>) -> Option<UssdResponse> {
        let response = UssdResponse {
            message,
            session_released: n != 1,
        };
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(response.clone());
        }
        Some(response)
    }
}

/// Begin a USSD session by sending a code (e.g. `*100#`).
///
/// Some modems answer inline within the `AT+CUSD` command's own response; others send `OK`
/// immediately and deliver the actual text later as a `+CUSD` URC. This function covers both:
/// if the command's own reply carries a `+CUSD` information response, it's used directly;
/// otherwise a waiter is parked on `session` and resolved by a later call to
/// [`UssdSession::handle_cusd_urc`].
pub async fn send_ussd(transport: &AtTransport, session: &mut UssdSession, code: &str) -> ModemResult<UssdResponse> {
    if session.is_pending() {
        return Err(ModemError::InvalidState("a USSD session is already in progress".into()));
    }
    let (tx, rx) = oneshot::channel();
    session.waiter = Some(tx);

    let resp = transport
        .write(
            AtCommand::Text {
                text: format!("AT+CUSD=1,\"{}\",15", code),
                expected: vec!["+CUSD".into()],
            },
            USSD_TIMEOUT,
        )
        .await?;
    resp.assert_ok()?;

    if let Some(value) = resp.extract_named_response_opt("+CUSD")? {
        if let Some(response) = parse_inline(value) {
            session.waiter = None;
            return Ok(response);
        }
    }

    match timeout(USSD_TIMEOUT, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(ModemError::Closed),
        Err(_) => {
            session.waiter = None;
            Err(ModemError::Timeout { partial: vec![] })
        }
    }
}

/// Reply within an open (not yet released) USSD session.
pub async fn reply(transport: &AtTransport, session: &mut UssdSession, text: &str) -> ModemResult<UssdResponse> {
    if session.is_pending() {
        return Err(ModemError::InvalidState("a USSD session is already in progress".into()));
    }
    let (tx, rx) = oneshot::channel();
    session.waiter = Some(tx);

    let resp = transport
        .write(
            AtCommand::Text {
                text: format!("AT+CUSD=1,\"{}\",15", text),
                expected: vec!["+CUSD".into()],
            },
            USSD_TIMEOUT,
        )
        .await?;
    resp.assert_ok()?;

    if let Some(value) = resp.extract_named_response_opt("+CUSD")? {
        if let Some(response) = parse_inline(value) {
            session.waiter = None;
            return Ok(response);
        }
    }
    match timeout(USSD_TIMEOUT, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(ModemError::Closed),
        Err(_) => {
            session.waiter = None;
            Err(ModemError::Timeout { partial: vec![] })
        }
    }
}

/// Cancel an open USSD session (`AT+CUSD=2`).
pub async fn cancel(transport: &AtTransport, session: &mut UssdSession) -> ModemResult<()> {
    session.waiter = None;
    transport
        .write(
            AtCommand::Equals {
                param: "+CUSD".into(),
                value: AtValue::Integer(2),
            },
            USSD_TIMEOUT,
        )
        .await?
        .assert_ok()
}

fn parse_inline(value: &AtValue) -> Option<UssdResponse> {
    let arr = value.get_array().ok()?;
    let n = arr.first()?.get_integer().ok().copied()?;
    let message = arr.get(1).and_then(|v| v.get_string().ok()).cloned();
    Some(UssdResponse {
        message,
        session_released: n != 1,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handle_cusd_urc_resolves_waiter() {
        let mut session = UssdSession::new();
        let (tx, mut rx) = oneshot::channel();
        session.waiter = Some(tx);
        session.handle_cusd_urc(2, Some("bye".into()));
        let resp = rx.try_recv().unwrap();
        assert!(resp.session_released);
        assert_eq!(resp.message.as_deref(), Some("bye"));
        assert!(!session.is_pending());
    }

    #[test]
    fn n_zero_releases() {
        let mut session = UssdSession::new();
        let resp = session.handle_cusd_urc(0, Some("menu".into())).unwrap();
        assert!(resp.session_released);
    }

    #[test]
    fn n_one_keeps_session_open() {
        let mut session = UssdSession::new();
        let resp = session.handle_cusd_urc(1, Some("Enter PIN:".into())).unwrap();
        assert!(!resp.session_released);
    }
}
