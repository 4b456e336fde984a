//! The AT transport: a background task that owns the serial port and multiplexes
//! synchronous command/response exchanges against asynchronous URCs arriving on the same
//! byte stream.
//!
//! This is the modernized descendant of the teacher's `future.rs`/`lib.rs` pair: the same
//! "one background task owns the framed stream, requests arrive over a channel, replies go
//! back over a oneshot" shape, expressed with `tokio::sync` instead of `futures` 0.1.
use crate::at::{AtCommand, AtResponse, AtResponsePacket, AtResultCode};
use crate::codec::AtCodec;
use crate::error::{ModemError, ModemResult};
use crate::error_codes::cme;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

/// Whether a pending command completes on a normal result-code line, or as soon as the `> `
/// prompt pseudo-line appears (used for the SMS body handshake).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Complete once a result code line terminates the exchange.
    ResultCode,
    /// Complete as soon as the interactive prompt appears.
    Prompt,
}

pub(crate) struct Request {
    command: AtCommand,
    expected: Vec<String>,
    completion: Completion,
    notif: oneshot::Sender<ModemResult<AtResponsePacket>>,
    partial: Arc<Mutex<Vec<String>>>,
}

struct PendingState {
    notif: oneshot::Sender<ModemResult<AtResponsePacket>>,
    expected: Vec<String>,
    completion: Completion,
    responses: Vec<AtResponse>,
    partial: Arc<Mutex<Vec<String>>>,
}

/// The background task driving the serial port. Spawned once by `AtTransport::open` and run
/// to completion (or to the death of the last handle) on the `tokio` runtime.
pub(crate) struct TransportTask<T> {
    inner: Framed<T, AtCodec>,
    rx: mpsc::UnboundedReceiver<Request>,
    urc_tx: mpsc::UnboundedSender<AtResponse>,
    cur: Option<PendingState>,
    queue: std::collections::VecDeque<Request>,
}

impl<T> TransportTask<T>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn new(
        inner: Framed<T, AtCodec>,
        rx: mpsc::UnboundedReceiver<Request>,
        urc_tx: mpsc::UnboundedSender<AtResponse>,
    ) -> Self {
        Self {
            inner,
            rx,
            urc_tx,
            cur: None,
            queue: std::collections::VecDeque::new(),
        }
    }

    fn complete(partial: &Arc<Mutex<Vec<String>>>) {
        partial.lock().unwrap().clear();
    }

    fn note_line(partial: &Arc<Mutex<Vec<String>>>, resp: &AtResponse) {
        let text = match resp {
            AtResponse::InformationResponse { param, response } => format!("{}: {}", param, response),
            AtResponse::Unknown(s) => s.clone(),
            AtResponse::ResultCode(c) => format!("{}", c),
            AtResponse::Prompt => "> ".to_string(),
        };
        partial.lock().unwrap().push(text);
    }

    fn start_next(&mut self) -> ModemResult<()> {
        if self.cur.is_none() {
            if let Some(req) = self.queue.pop_front() {
                debug!(command = %req.command, "starting new request");
                use futures::Sink;
                let Request { command, expected, completion, notif, partial } = req;
                // `Framed`'s underlying buffered writer never applies backpressure on a
                // text command, so `start_send` always succeeds immediately; the flush
                // that actually pushes bytes to the wire happens in `run`'s loop body.
                let mut sink = std::pin::Pin::new(&mut self.inner);
                sink.as_mut().start_send(command)?;
                self.cur = Some(PendingState {
                    notif,
                    expected,
                    completion,
                    responses: vec![],
                    partial,
                });
            }
        }
        Ok(())
    }

    pub(crate) async fn run(mut self) {
        use futures::{SinkExt, StreamExt};
        loop {
            tokio::select! {
                biased;
                maybe_req = self.rx.recv() => {
                    match maybe_req {
                        Some(req) => self.queue.push_back(req),
                        None => {
                            debug!("all transport handles dropped, background task exiting");
                            return;
                        }
                    }
                }
                frame = self.inner.next() => {
                    match frame {
                        Some(Ok(lines)) => self.handle_lines(lines),
                        Some(Err(e)) => {
                            warn!(error = %e, "transport decode error");
                        }
                        None => {
                            debug!("serial stream closed, background task exiting");
                            return;
                        }
                    }
                }
            }
            if let Err(e) = self.start_next() {
                warn!(error = %e, "failed writing command to serial port");
            }
            if let Err(e) = self.inner.flush().await {
                warn!(error = %e, "failed flushing serial port");
            }
        }
    }

    fn handle_lines(&mut self, lines: Vec<AtResponse>) {
        let Some(mut state) = self.cur.take() else {
            for resp in lines {
                let _ = self.urc_tx.send(resp);
            }
            return;
        };
        for resp in lines {
            Self::note_line(&state.partial, &resp);
            let done = match state.completion {
                Completion::Prompt => resp.is_prompt() || resp.is_result_code(),
                Completion::ResultCode => resp.is_result_code(),
            };
            if !done {
                state.responses.push(resp);
                continue;
            }
            match (state.completion, &resp) {
                (Completion::Prompt, AtResponse::Prompt) => {
                    Self::complete(&state.partial);
                    let _ = state.notif.send(Ok(AtResponsePacket {
                        responses: vec![],
                        status: AtResultCode::Ok,
                    }));
                    return;
                }
                _ => {
                    let status = if let AtResponse::ResultCode(c) = resp {
                        c
                    } else {
                        unreachable!("done implies a result-code or prompt response")
                    };
                    let mut resps = vec![];
                    for r in state.responses.drain(..) {
                        match r {
                            AtResponse::InformationResponse { param, response } => {
                                if state.expected.contains(&param) {
                                    resps.push(AtResponse::InformationResponse { param, response });
                                } else {
                                    let _ = self
                                        .urc_tx
                                        .send(AtResponse::InformationResponse { param, response });
                                }
                            }
                            other => resps.push(other),
                        }
                    }
                    Self::complete(&state.partial);
                    let _ = state.notif.send(Ok(AtResponsePacket { responses: resps, status }));
                    return;
                }
            }
        }
        self.cur = Some(state);
    }
}

/// Handle to the background transport task. Cloneable; every clone shares the same
/// background task and therefore the same serialized command queue.
#[derive(Clone)]
pub struct AtTransport {
    tx: mpsc::UnboundedSender<Request>,
    wait_delay: Arc<Mutex<Duration>>,
}

impl AtTransport {
    /// Spawn the background task over an already-open async byte stream (a serial port, or
    /// an in-memory duplex pipe for tests), returning the handle plus the receiver for
    /// unsolicited lines.
    pub fn open<T>(stream: T) -> (Self, mpsc::UnboundedReceiver<AtResponse>)
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(stream, AtCodec);
        let (tx, rx) = mpsc::unbounded_channel();
        let (urc_tx, urc_rx) = mpsc::unbounded_channel();
        let task = TransportTask::new(framed, rx, urc_tx);
        tokio::spawn(task.run());
        (
            Self {
                tx,
                wait_delay: Arc::new(Mutex::new(Duration::from_millis(0))),
            },
            urc_rx,
        )
    }

    /// Issue a command and wait for its terminating result code, applying the 515/"SIM
    /// busy" backoff-and-retry policy from spec §4.B.
    pub async fn write(
        &self,
        command: AtCommand,
        timeout_dur: Duration,
    ) -> ModemResult<AtResponsePacket> {
        let mut backed_off = None;
        loop {
            let delay = *self.wait_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let expected = command.expected();
            let result = self
                .exchange(command.clone(), expected, Completion::ResultCode, timeout_dur)
                .await;
            let busy_code = match &result {
                Err(ModemError::Cme { code }) if *code == cme::PLEASE_WAIT || *code == cme::SIM_BUSY => {
                    Some(*code)
                }
                _ => None,
            };
            match busy_code {
                Some(code) => {
                    *self.wait_delay.lock().unwrap() += Duration::from_millis(200);
                    warn!(code, "modem busy, backing off and retrying");
                    backed_off = Some(code);
                    continue;
                }
                None => {
                    if let Some(code) = backed_off {
                        self.note_recovered(code == cme::PLEASE_WAIT);
                    }
                    return result;
                }
            }
        }
    }

    /// Fire-and-forget: enqueue the command but don't wait for a reply.
    pub fn write_no_wait(&self, command: AtCommand) {
        let (notif, _rx) = oneshot::channel();
        let expected = command.expected();
        let req = Request {
            command,
            expected,
            completion: Completion::ResultCode,
            notif,
            partial: Arc::new(Mutex::new(vec![])),
        };
        let _ = self.tx.send(req);
    }

    /// Issue a command and wait only for the `> ` prompt (or an early error), used before
    /// writing an SMS body.
    pub async fn write_expect_prompt(
        &self,
        command: AtCommand,
        timeout_dur: Duration,
    ) -> ModemResult<()> {
        let expected = command.expected();
        self.exchange(command, expected, Completion::Prompt, timeout_dur)
            .await?;
        Ok(())
    }

    /// Reset the backoff delay after a recovered 515/14, per spec §4.B: 100ms for a
    /// recovered 515, 0 for a recovered 14.
    pub fn note_recovered(&self, was_please_wait: bool) {
        let mut guard = self.wait_delay.lock().unwrap();
        *guard = if was_please_wait {
            Duration::from_millis(100)
        } else {
            Duration::from_millis(0)
        };
    }

    async fn exchange(
        &self,
        command: AtCommand,
        expected: Vec<String>,
        completion: Completion,
        timeout_dur: Duration,
    ) -> ModemResult<AtResponsePacket> {
        let (notif, rx) = oneshot::channel();
        let partial = Arc::new(Mutex::new(vec![]));
        let req = Request {
            command,
            expected,
            completion,
            notif,
            partial: partial.clone(),
        };
        if self.tx.send(req).is_err() {
            return Err(ModemError::Closed);
        }
        match timeout(timeout_dur, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ModemError::Closed),
            Err(_) => {
                let partial = partial.lock().unwrap().clone();
                trace!(?partial, "command timed out");
                Err(ModemError::Timeout { partial })
            }
        }
    }
}
