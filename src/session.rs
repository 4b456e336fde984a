//! Public Façade (spec §4.H) and the concurrency model backing it (spec §5).
//!
//! `Modem` is a cheap, `Clone`-able handle: the transport already serializes writes through its
//! own background task and request queue (see [`crate::transport`]), so the only shared,
//! mutable state left is the stuff spec §5 explicitly calls out - the active-call table and
//! the sent-SMS table - plus capability/dialect data fixed at connect time and the optional
//! callback slots. All of that lives behind one `tokio::sync::Mutex`, following spec §5's
//! allowance to do exactly that when callbacks may run on a different task/thread than the
//! caller.
use crate::at::{AtCommand, AtValue};
use crate::call::{self, Call, CallEngine};
use crate::dialect::{CallUrc, Dialect};
use crate::error::{ModemError, ModemResult};
use crate::probe::{self, Capabilities};
use crate::sms::{self, MessageStatus, ReceivedSms, SentSms, SmsEngine, StatusReport};
use crate::transport::AtTransport;
use crate::urc::{UrcEvent, UrcParser};
use crate::ussd::{self, UssdResponse, UssdSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection parameters. The serial port itself (baud/parity/stop bits: 115200 8N1, RTS off
/// per spec §6) is configured by the caller when constructing the byte stream passed to
/// [`Modem::connect`] - this config only covers driver-level behavior.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    /// Overall timeout applied to façade operations that don't have a more specific one.
    pub default_timeout: Duration,
    /// SIM PIN, sent via `AT+CPIN="<pin>"` during probing if `AT+CPIN?` reports the SIM isn't
    /// ready (spec §4.D step 5). Leave `None` for an unlocked SIM.
    pub pin: Option<String>,
}
impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            pin: None,
        }
    }
}

/// Called when a new incoming call is detected (`RING`/`+CLIP`).
pub type IncomingCallCallback = Box<dyn Fn(Call) + Send + Sync>;
/// Called when a new SMS is received and has been fetched from storage.
pub type SmsReceivedCallback = Box<dyn Fn(ReceivedSms) + Send + Sync>;
/// Called when a delivery status report arrives for a message this driver sent (or not -
/// spec §4.E: reports for untracked references are still delivered, with no [`sms::SentSms`]).
pub type SmsStatusReportCallback = Box<dyn Fn(StatusReport) + Send + Sync>;
/// Called on any call lifecycle transition.
pub type CallStatusCallback = Box<dyn Fn(CallUrc) + Send + Sync>;

/// Result of [`Modem::send_sms_full`]: one reference and one (possibly absent) delivery report
/// per concatenated part, in send order.
#[derive(Debug, Clone)]
pub struct SentSmsResult {
    pub references: Vec<u8>,
    pub delivery_reports: Vec<Option<StatusReport>>,
}

#[derive(Default)]
struct Callbacks {
    incoming_call: Option<IncomingCallCallback>,
    sms_received: Option<SmsReceivedCallback>,
    sms_status_report: Option<SmsStatusReportCallback>,
    call_status_update: Option<CallStatusCallback>,
}

struct SessionState {
    capabilities: Capabilities,
    sms_engine: SmsEngine,
    calls: CallEngine,
    ussd: UssdSession,
    callbacks: Callbacks,
}

/// A connected modem. Cheaply `Clone`-able - every clone shares the same background transport
/// task and the same session state.
#[derive(Clone)]
pub struct Modem {
    transport: AtTransport,
    state: Arc<Mutex<SessionState>>,
    config: ModemConfig,
}

impl Modem {
    /// Run the capability probe over an already-open byte stream and spawn the URC event loop.
    /// This is the spec §4.H `connect()` operation.
    pub async fn connect<T>(stream: T, config: ModemConfig) -> ModemResult<Modem>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (transport, mut urc_rx) = AtTransport::open(stream);
        let capabilities = probe::probe(&transport, config.pin.as_deref()).await?;
        let state = Arc::new(Mutex::new(SessionState {
            capabilities,
            sms_engine: SmsEngine::new(),
            calls: CallEngine::new(),
            ussd: UssdSession::new(),
            callbacks: Callbacks::default(),
        }));

        let loop_state = state.clone();
        let loop_transport = transport.clone();
        tokio::spawn(async move {
            let mut parser = UrcParser::new();
            while let Some(line) = urc_rx.recv().await {
                let dialect = loop_state.lock().await.capabilities.dialect;
                if let Some(event) = parser.dispatch(line, Some(dialect)) {
                    handle_event(&loop_transport, &loop_state, event).await;
                }
            }
            debug!("URC channel closed, event loop exiting");
        });

        Ok(Modem { transport, state, config })
    }

    /// Open a serial port at `path` and run the capability probe over it (spec §6: 115200
    /// 8N1, RTS off / no flow control).
    pub async fn connect_serial(path: &str, baud_rate: u32, config: ModemConfig) -> ModemResult<Modem> {
        use tokio_serial::SerialPortBuilderExt;
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ModemError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Self::connect(port, config).await
    }

    /// Close the modem. The background task and event loop exit once every clone (and the
    /// spawned event-loop task's own reference) is dropped; this just drops this handle's.
    pub fn close(self) {
        drop(self);
    }

    pub async fn capabilities(&self) -> Capabilities {
        self.state.lock().await.capabilities.clone()
    }

    pub async fn manufacturer(&self) -> String {
        self.state.lock().await.capabilities.manufacturer.clone()
    }
    pub async fn model(&self) -> String {
        self.state.lock().await.capabilities.model.clone()
    }
    pub async fn revision(&self) -> String {
        self.state.lock().await.capabilities.revision.clone()
    }

    /// `AT+CGSN` - the modem's IMEI.
    pub async fn imei(&self) -> ModemResult<String> {
        self.read_single_line("+CGSN").await
    }

    /// `AT+CIMI` - the SIM's IMSI.
    pub async fn imsi(&self) -> ModemResult<String> {
        self.read_single_line("+CIMI").await
    }

    /// `AT+CNUM` - this SIM's own phone number, if the SIM exposes it.
    pub async fn own_number(&self) -> ModemResult<Option<String>> {
        let resp = self
            .transport
            .write(AtCommand::Execute { command: "+CNUM".into() }, self.config.default_timeout)
            .await?;
        resp.assert_ok()?;
        if let Some(value) = resp.extract_named_response_opt("+CNUM")? {
            if let Ok(arr) = value.get_array() {
                if let Some(number) = arr.get(1).and_then(|v| v.get_string().ok()) {
                    return Ok(Some(number.clone()));
                }
            }
        }
        Ok(None)
    }

    /// `AT+CSQ` - signal strength as a raw `(rssi, ber)` pair (spec leaves scaling to callers).
    pub async fn signal_strength(&self) -> ModemResult<(u32, u32)> {
        let resp = self
            .transport
            .write(AtCommand::Execute { command: "+CSQ".into() }, self.config.default_timeout)
            .await?;
        let value = resp.extract_named_response("+CSQ")?;
        let arr = value.get_array()?;
        let rssi = *arr.first().ok_or(ModemError::ExpectedResponse("+CSQ".into()))?.get_integer()?;
        let ber = *arr.get(1).ok_or(ModemError::ExpectedResponse("+CSQ".into()))?.get_integer()?;
        Ok((rssi, ber))
    }

    /// `AT+COPS?` - the registered network's name, if any.
    pub async fn network_name(&self) -> ModemResult<Option<String>> {
        let resp = self
            .transport
            .write(AtCommand::Read { param: "+COPS".into() }, self.config.default_timeout)
            .await?;
        if let Some(value) = resp.extract_named_response_opt("+COPS")? {
            if let Ok(arr) = value.get_array() {
                if let Some(name) = arr.get(2).and_then(|v| v.get_string().ok()) {
                    return Ok(Some(name.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn read_single_line(&self, command: &str) -> ModemResult<String> {
        let resp = self
            .transport
            .write(AtCommand::Execute { command: command.into() }, self.config.default_timeout)
            .await?;
        resp.assert_ok()?;
        for r in &resp.responses {
            if let crate::at::AtResponse::Unknown(s) = r {
                return Ok(s.trim().to_string());
            }
        }
        Ok(String::new())
    }

    /// Get whether SMS text mode is enabled (`AT+CMGF?`). This driver's baseline is PDU mode
    /// (`0`), toggling transiently into text mode only around a short GSM-7 [`Modem::send_sms`]
    /// body; exposed for callers/tests that want to confirm the baseline.
    pub async fn sms_text_mode(&self) -> ModemResult<bool> {
        let resp = self
            .transport
            .write(AtCommand::Read { param: "+CMGF".into() }, self.config.default_timeout)
            .await?;
        let value = resp.extract_named_response("+CMGF")?;
        Ok(*value.get_integer()? == 1)
    }

    /// Set SMS text mode. Setting this to `true` is accepted but strongly discouraged: the
    /// send/receive paths in [`crate::sms`] assume PDU mode.
    pub async fn set_sms_text_mode(&self, enabled: bool) -> ModemResult<()> {
        self.transport
            .write(
                AtCommand::Equals {
                    param: "+CMGF".into(),
                    value: AtValue::Integer(if enabled { 1 } else { 0 }),
                },
                self.config.default_timeout,
            )
            .await?
            .assert_ok()
    }

    /// `AT+CSCA?` - the current SMSC address.
    pub async fn smsc(&self) -> ModemResult<String> {
        let resp = self
            .transport
            .write(AtCommand::Read { param: "+CSCA".into() }, self.config.default_timeout)
            .await?;
        let value = resp.extract_named_response("+CSCA")?;
        let arr = value.get_array()?;
        Ok(arr
            .first()
            .and_then(|v| v.get_string().ok())
            .cloned()
            .unwrap_or_default())
    }

    /// `AT+CSCA=` - set the SMSC address.
    pub async fn set_smsc(&self, number: &str) -> ModemResult<()> {
        self.transport
            .write(
                AtCommand::Equals {
                    param: "+CSCA".into(),
                    value: AtValue::String(number.into()),
                },
                self.config.default_timeout,
            )
            .await?
            .assert_ok()
    }

    /// Send a text SMS (spec §4.E step 1). Returns the message reference(s) used, one per
    /// concatenated part.
    pub async fn send_sms(&self, destination: &str, text: &str) -> ModemResult<Vec<u8>> {
        Ok(self.send_sms_full(destination, text, false, None).await?.references)
    }

    /// As [`Modem::send_sms`], but send as a flash/class-0 message.
    pub async fn send_sms_with_flags(&self, destination: &str, text: &str, send_flash: bool) -> ModemResult<Vec<u8>> {
        Ok(self.send_sms_full(destination, text, send_flash, None).await?.references)
    }

    /// Send a text SMS, optionally waiting for the delivery status report(s) of each
    /// concatenated part (spec §4.E step 5 / §5's "wait for the delivery-report condition").
    /// `wait_for_delivery_report` is the per-part budget to wait for a `StatusReport`; the
    /// corresponding slot in the result's `delivery_reports` stays `None` if it times out or
    /// no wait was requested.
    pub async fn send_sms_full(
        &self,
        destination: &str,
        text: &str,
        send_flash: bool,
        wait_for_delivery_report: Option<Duration>,
    ) -> ModemResult<SentSmsResult> {
        let reference = rand::random::<u8>();
        let refs = sms::send_sms(&self.transport, destination, text, reference, send_flash).await?;
        let parts_total = refs.len() as u8;
        let mut waiters = Vec::with_capacity(refs.len());
        {
            let mut state = self.state.lock().await;
            for r in &refs {
                state.sms_engine.note_sent(*r, destination.to_string(), parts_total);
                if wait_for_delivery_report.is_some() {
                    waiters.push(state.sms_engine.register_waiter(*r));
                }
            }
        }
        let mut delivery_reports = vec![None; refs.len()];
        if let Some(budget) = wait_for_delivery_report {
            for (slot, rx) in delivery_reports.iter_mut().zip(waiters) {
                if let Ok(Ok(report)) = tokio::time::timeout(budget, rx).await {
                    *slot = Some(report);
                }
            }
        }
        Ok(SentSmsResult { references: refs, delivery_reports })
    }

    /// Look up a message this driver sent by its reference, if delivery is still being tracked
    /// (spec §4.E step 5 / §5): the entry is evicted once every concatenated part has a
    /// recorded delivery report, so `None` can mean "fully delivered already" as well as
    /// "unknown reference".
    pub async fn sent_sms_status(&self, reference: u8) -> Option<SentSms> {
        self.state.lock().await.sms_engine.get_sent(reference).cloned()
    }

    pub async fn list_stored_sms(&self, status: MessageStatus) -> ModemResult<Vec<ReceivedSms>> {
        sms::list_stored_sms(&self.transport, status).await
    }

    pub async fn read_stored_sms(&self, index: u32) -> ModemResult<ReceivedSms> {
        sms::read_stored_sms(&self.transport, index).await
    }

    pub async fn delete_stored_sms(&self, index: u32) -> ModemResult<()> {
        sms::delete_stored_sms(&self.transport, index).await
    }

    pub async fn delete_multiple_stored_sms(&self, options: sms::DeletionOptions) -> ModemResult<()> {
        sms::delete_multiple_stored_sms(&self.transport, options).await
    }

    /// Fetch and clear out every currently-stored received SMS, delivering each through the
    /// normal `smsReceived` callback path before deleting it - for catching up on messages
    /// that arrived while nothing was listening (spec §4.H, a supplemented operation not named
    /// by an AT side-effect of its own).
    pub async fn process_stored_sms(&self) -> ModemResult<Vec<ReceivedSms>> {
        let messages = sms::list_stored_sms(&self.transport, MessageStatus::ReceivedUnread).await?;
        for msg in &messages {
            self.emit_sms_received(msg.clone()).await;
            if let Err(e) = sms::delete_stored_sms(&self.transport, msg.index).await {
                warn!(index = msg.index, error = %e, "failed to delete processed SMS");
            }
        }
        Ok(messages)
    }

    async fn emit_sms_received(&self, msg: ReceivedSms) {
        let state = self.state.lock().await;
        if let Some(cb) = &state.callbacks.sms_received {
            cb(msg);
        }
    }

    pub async fn send_ussd(&self, code: &str) -> ModemResult<UssdResponse> {
        let mut state = self.state.lock().await;
        ussd::send_ussd(&self.transport, &mut state.ussd, code).await
    }

    pub async fn reply_ussd(&self, text: &str) -> ModemResult<UssdResponse> {
        let mut state = self.state.lock().await;
        ussd::reply(&self.transport, &mut state.ussd, text).await
    }

    pub async fn cancel_ussd(&self) -> ModemResult<()> {
        let mut state = self.state.lock().await;
        ussd::cancel(&self.transport, &mut state.ussd).await
    }

    /// Dial a number, returning the resulting call id once the call engine observes it was
    /// initiated (spec §4.F step 2).
    pub async fn dial(&self, number: &str) -> ModemResult<u32> {
        let mut state = self.state.lock().await;
        let dialect = state.capabilities.dialect;
        call::dial(&self.transport, &mut state.calls, dialect, number).await
    }

    pub async fn answer(&self) -> ModemResult<()> {
        call::answer(&self.transport).await
    }

    /// Hang up a call by id, removing it from [`Modem::active_calls`]'s table once the
    /// hangup succeeds (testable invariant 3).
    pub async fn hangup(&self, call_id: u32) -> ModemResult<()> {
        let mut state = self.state.lock().await;
        call::hangup(&self.transport, &mut state.calls, call_id).await
    }

    pub async fn send_dtmf(&self, call_id: u32, tone: char) -> ModemResult<()> {
        let dialect = self.state.lock().await.capabilities.dialect;
        call::send_dtmf(&self.transport, dialect, call_id, tone).await
    }

    pub async fn active_calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.active_calls()
    }

    /// Poll `AT+CREG?` until the modem reports registered (home or roaming), or `timeout`
    /// elapses - a supplemented convenience built from the same polling idiom as
    /// [`call::poll_for_new_call`], grounded on the original source's connection-wait helper.
    pub async fn wait_for_network_coverage(&self, timeout_dur: Duration) -> ModemResult<()> {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            let resp = self
                .transport
                .write(AtCommand::Read { param: "+CREG".into() }, self.config.default_timeout)
                .await?;
            if let Some(value) = resp.extract_named_response_opt("+CREG")? {
                if let Ok(arr) = value.get_array() {
                    if let Some(stat) = arr.get(1).and_then(|v| v.get_integer().ok()) {
                        if *stat == 1 || *stat == 5 {
                            return Ok(());
                        }
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ModemError::Timeout { partial: vec![] });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Configure unconditional call forwarding (`AT+CCFC=0,3,<number>`).
    pub async fn set_forwarding(&self, number: Option<&str>) -> ModemResult<()> {
        let text = match number {
            Some(n) => format!("AT+CCFC=0,3,\"{}\"", n),
            None => "AT+CCFC=0,4".into(),
        };
        self.transport
            .write(
                AtCommand::Text {
                    text,
                    expected: vec!["+CCFC".into()],
                },
                self.config.default_timeout,
            )
            .await?
            .assert_ok()
    }

    /// Query unconditional call forwarding status (`AT+CCFC=0,2`).
    pub async fn check_forwarding(&self) -> ModemResult<Option<String>> {
        let resp = self
            .transport
            .write(
                AtCommand::Text {
                    text: "AT+CCFC=0,2".into(),
                    expected: vec!["+CCFC".into()],
                },
                self.config.default_timeout,
            )
            .await?;
        if let Some(value) = resp.extract_named_response_opt("+CCFC")? {
            if let Ok(arr) = value.get_array() {
                if arr.first().and_then(|v| v.get_integer().ok()) == Some(&1) {
                    if let Some(number) = arr.get(2).and_then(|v| v.get_string().ok()) {
                        return Ok(Some(number.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    pub async fn on_incoming_call(&self, cb: IncomingCallCallback) {
        self.state.lock().await.callbacks.incoming_call = Some(cb);
    }
    pub async fn on_sms_received(&self, cb: SmsReceivedCallback) {
        self.state.lock().await.callbacks.sms_received = Some(cb);
    }
    pub async fn on_sms_status_report(&self, cb: SmsStatusReportCallback) {
        self.state.lock().await.callbacks.sms_status_report = Some(cb);
    }
    pub async fn on_call_status_update(&self, cb: CallStatusCallback) {
        self.state.lock().await.callbacks.call_status_update = Some(cb);
    }
}

async fn handle_event(transport: &AtTransport, state: &Arc<Mutex<SessionState>>, event: UrcEvent) {
    match event {
        UrcEvent::Ring | UrcEvent::Clip { .. } => {
            let number = if let UrcEvent::Clip { number } = &event {
                Some(number.clone())
            } else {
                None
            };
            let mut guard = state.lock().await;
            if let Some(id) = guard.calls.note_incoming_ring(number) {
                let call = guard.calls.get(id).cloned();
                if let (Some(cb), Some(call)) = (&guard.callbacks.incoming_call, call) {
                    cb(call);
                }
            }
        }
        UrcEvent::NewSms(notif) => {
            let index = notif.index;
            match sms::read_stored_sms(transport, index).await {
                Ok(msg) => {
                    {
                        let guard = state.lock().await;
                        if let Some(cb) = &guard.callbacks.sms_received {
                            cb(msg);
                        }
                    }
                    if let Err(e) = sms::delete_stored_sms(transport, index).await {
                        warn!(index, error = %e, "failed to delete SMS after delivering to callback");
                    }
                }
                Err(e) => warn!(index, error = %e, "failed to fetch new SMS"),
            }
        }
        UrcEvent::NewStatusReport(notif) => {
            let index = notif.index;
            match sms::read_stored_status_report(transport, index).await {
                Ok(report) => deliver_status_report(state, report).await,
                Err(e) => warn!(index, error = %e, "failed to fetch new status report"),
            }
        }
        UrcEvent::StatusReportPdu(hex) => match sms::decode_status_report(&hex) {
            Ok(report) => deliver_status_report(state, report).await,
            Err(e) => warn!(error = %e, "dropping malformed +CDS status report"),
        },
        UrcEvent::Ussd { n, message, .. } => {
            let mut guard = state.lock().await;
            guard.ussd.handle_cusd_urc(n, message);
        }
        UrcEvent::Call(call_urc) => {
            let mut guard = state.lock().await;
            guard.calls.handle_call_urc(call_urc.clone());
            if let Some(cb) = &guard.callbacks.call_status_update {
                cb(call_urc);
            }
        }
        UrcEvent::Dtmf { .. } | UrcEvent::Other(_) => {}
    }
}

async fn deliver_status_report(state: &Arc<Mutex<SessionState>>, report: StatusReport) {
    let mut guard = state.lock().await;
    let _ = guard.sms_engine.note_status_report(&report);
    if let Some(cb) = &guard.callbacks.sms_status_report {
        cb(report);
    }
}
