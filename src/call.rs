//! Call Engine (spec §4.F): dialing, incoming-call detection, lifecycle tracking, DTMF and
//! hangup, generalized across the per-dialect call-URC tables in [`crate::dialect`].
use crate::at::AtCommand;
use crate::dialect::{CallUrc, Dialect};
use crate::error::{ModemError, ModemResult};
use crate::error_codes::cme;
use crate::transport::AtTransport;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const HANGUP_TIMEOUT: Duration = Duration::from_secs(10);
const DTMF_TIMEOUT: Duration = Duration::from_secs(10);

/// Which side originated a tracked call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Lifecycle state of a tracked call (spec §3 Data Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Dialing,
    Ringing,
    Active,
    Ended,
}

/// A call this driver knows about - either one it placed, or one reported by `RING`/`+CLIP`.
#[derive(Debug, Clone)]
pub struct Call {
    pub id: u32,
    pub direction: CallDirection,
    pub number: Option<String>,
    pub state: CallState,
}

/// A waiter registered by `dial()`, resolved the first time a matching `Initiated` URC arrives
/// (spec §4.F: "dial waits for the dialect's initiated-call URC, or polls `AT+CLCC`").
struct InitiatedWaiter {
    tx: oneshot::Sender<CallUrc>,
}

/// The active-call table plus any in-flight waiters. Owned by the session behind a mutex
/// (spec §5's explicit "wrap the active-call map in a mutex" allowance), since call-state
/// URCs and public API calls can race on separate threads when callbacks are registered.
#[derive(Default)]
pub struct CallEngine {
    calls: HashMap<u32, Call>,
    waiting_for_initiated: Vec<InitiatedWaiter>,
    next_synthetic_id: u32,
}

impl CallEngine {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            waiting_for_initiated: vec![],
            next_synthetic_id: 1,
        }
    }

    pub fn get(&self, id: u32) -> Option<&Call> {
        self.calls.get(&id)
    }

    pub fn active_calls(&self) -> Vec<Call> {
        self.calls.values().cloned().collect()
    }

    /// Remove an entry from the active-call table directly, without waiting for an `Ended`
    /// URC. Used by [`hangup`] so a locally-initiated hangup clears the map immediately
    /// (testable invariant 3: every entry is removed by exactly one of `Ended`, `Rejected`,
    /// or `hangup`).
    pub fn remove(&mut self, id: u32) -> Option<Call> {
        self.calls.remove(&id)
    }

    /// Fold a dispatched call URC into the active-call table, resolving any waiter registered
    /// by an in-flight `dial()`.
    pub fn handle_call_urc(&mut self, urc: CallUrc) {
        match urc.clone() {
            CallUrc::Initiated { id, .. } => {
                self.calls.insert(
                    id,
                    Call {
                        id,
                        direction: CallDirection::Outgoing,
                        number: None,
                        state: CallState::Ringing,
                    },
                );
                if let Some(waiter) = self.waiting_for_initiated.pop() {
                    let _ = waiter.tx.send(urc);
                }
            }
            CallUrc::Answered { id } => {
                if let Some(id) = id {
                    if let Some(call) = self.calls.get_mut(&id) {
                        call.state = CallState::Active;
                    }
                } else {
                    for call in self.calls.values_mut() {
                        call.state = CallState::Active;
                    }
                }
            }
            CallUrc::Ended { id } => {
                if let Some(id) = id {
                    self.calls.remove(&id);
                } else {
                    self.calls.clear();
                }
            }
        }
    }

    /// Register (or update) an incoming call from a `RING` (and, if `+CLIP` arrived too, its
    /// caller-ID number). Re-rings for an already-known incoming call are deduplicated.
    pub fn note_incoming_ring(&mut self, number: Option<String>) -> Option<u32> {
        if let Some(existing) = self
            .calls
            .values()
            .find(|c| c.direction == CallDirection::Incoming && c.state == CallState::Ringing)
        {
            return if number.is_some() { None } else { Some(existing.id) };
        }
        let id = self.next_synthetic_id;
        self.next_synthetic_id += 1;
        self.calls.insert(
            id,
            Call {
                id,
                direction: CallDirection::Incoming,
                number,
                state: CallState::Ringing,
            },
        );
        Some(id)
    }
}

/// Place an outgoing call. For dialects with an "initiated" URC (everything but `Generic`),
/// waits on that URC; for `Generic`, polls `AT+CLCC` until a matching entry appears, per spec
/// §4.F step 2.
pub async fn dial(
    transport: &AtTransport,
    engine: &mut CallEngine,
    dialect: Dialect,
    number: &str,
) -> ModemResult<u32> {
    let (tx, rx) = oneshot::channel();
    if dialect.has_initiated_urc() {
        engine.waiting_for_initiated.push(InitiatedWaiter { tx });
    }
    transport
        .write_no_wait(AtCommand::Text {
            text: format!("ATD{};", number),
            expected: vec![],
        });

    if dialect.has_initiated_urc() {
        match timeout(DIAL_TIMEOUT, rx).await {
            Ok(Ok(CallUrc::Initiated { id, .. })) => Ok(id),
            Ok(Ok(_)) | Ok(Err(_)) => Err(ModemError::InvalidState("call was never initiated".into())),
            Err(_) => Err(ModemError::Timeout { partial: vec![] }),
        }
    } else {
        poll_for_new_call(transport, engine, DIAL_TIMEOUT).await
    }
}

async fn poll_for_new_call(transport: &AtTransport, engine: &mut CallEngine, budget: Duration) -> ModemResult<u32> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(ModemError::Timeout { partial: vec![] });
        }
        let resp = transport
            .write(AtCommand::Execute { command: "+CLCC".into() }, Duration::from_secs(5))
            .await?;
        resp.assert_ok()?;
        for r in &resp.responses {
            if let crate::at::AtResponse::InformationResponse { param, response } = r {
                if param != "+CLCC" {
                    continue;
                }
                if let Ok(arr) = response.get_array() {
                    if let Some(id) = arr.first().and_then(|v| v.get_integer().ok()).copied() {
                        engine.calls.entry(id).or_insert(Call {
                            id,
                            direction: CallDirection::Outgoing,
                            number: None,
                            state: CallState::Ringing,
                        });
                        return Ok(id);
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

/// Answer an incoming call (`ATA`).
pub async fn answer(transport: &AtTransport) -> ModemResult<()> {
    transport
        .write(AtCommand::Basic { command: "A".into(), number: None }, DIAL_TIMEOUT)
        .await?
        .assert_ok()
}

/// Hang up a call (`AT+CHUP`, falling back to `ATH` if unsupported), removing `call_id` from
/// `engine`'s active-call table on success - some modems never emit an `Ended` URC for a
/// locally-initiated hangup, so the map entry has to be cleared here instead (testable
/// invariant 3).
pub async fn hangup(transport: &AtTransport, engine: &mut CallEngine, call_id: u32) -> ModemResult<()> {
    let result = match transport
        .write(AtCommand::Execute { command: "+CHUP".into() }, HANGUP_TIMEOUT)
        .await
    {
        Ok(resp) => resp.assert_ok(),
        Err(ModemError::CommandNotSupported) => {
            transport
                .write(AtCommand::Basic { command: "H".into(), number: None }, HANGUP_TIMEOUT)
                .await?
                .assert_ok()
        }
        Err(e) => Err(e),
    };
    if result.is_ok() {
        engine.remove(call_id);
    }
    result
}

/// Send a DTMF tone on an active call.
///
/// Spec §4.F: a CME 3 ("operation not allowed") or 30 ("no network service") response while
/// sending a tone means the call was torn down mid-send; this is surfaced as
/// `ModemError::Interrupted`, the equivalent of the Python source's `InterruptedException`.
pub async fn send_dtmf(transport: &AtTransport, dialect: Dialect, call_id: u32, tone: char) -> ModemResult<()> {
    let cmd = dialect.dtmf_command(call_id, tone);
    debug!(tone, call_id, "sending DTMF tone");
    match transport
        .write(
            AtCommand::Text {
                text: format!("AT{}", cmd),
                expected: vec![],
            },
            DTMF_TIMEOUT,
        )
        .await
    {
        Ok(resp) => resp.assert_ok(),
        Err(ModemError::Cme { code }) if code == cme::NOT_ALLOWED || code == cme::NO_NETWORK_SERVICE => {
            warn!(call_id, "DTMF interrupted: call no longer active");
            Err(ModemError::Interrupted(format!("call {} ended during DTMF send", call_id)))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initiated_urc_populates_table() {
        let mut engine = CallEngine::new();
        engine.handle_call_urc(CallUrc::Initiated { id: 5, call_type: 0 });
        assert_eq!(engine.get(5).unwrap().state, CallState::Ringing);
    }

    #[test]
    fn ended_urc_removes_call() {
        let mut engine = CallEngine::new();
        engine.handle_call_urc(CallUrc::Initiated { id: 5, call_type: 0 });
        engine.handle_call_urc(CallUrc::Ended { id: Some(5) });
        assert!(engine.get(5).is_none());
    }

    #[test]
    fn remove_clears_active_call_entry() {
        let mut engine = CallEngine::new();
        engine.handle_call_urc(CallUrc::Initiated { id: 5, call_type: 0 });
        assert!(engine.get(5).is_some());
        engine.remove(5);
        assert!(engine.get(5).is_none());
    }

    #[test]
    fn incoming_ring_dedupes() {
        let mut engine = CallEngine::new();
        let id1 = engine.note_incoming_ring(None).unwrap();
        let id2 = engine.note_incoming_ring(None);
        assert_eq!(id2, Some(id1));
    }
}
