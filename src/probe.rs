//! Capability Prober (spec §4.D): the fixed 11-step sequence run once at `connect()` time to
//! reset the modem into a known state, read its identity, and pick a [`Dialect`].
use crate::at::{AtCommand, AtValue};
use crate::dialect::{self, Dialect, DialectSignals};
use crate::error::{ModemError, ModemResult};
use crate::error_codes::cme;
use crate::transport::AtTransport;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the probe learned about this modem. Immutable after `connect()` returns (spec §3).
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    pub dialect: Dialect,
    pub has_clac: bool,
    pub supported_commands: Vec<String>,
    pub simcom_dtmf: bool,
    pub supports_clip: bool,
    pub supports_crc: bool,
    pub supports_cvhu: bool,
}

async fn try_execute(transport: &AtTransport, command: &str) -> ModemResult<crate::at::AtResponsePacket> {
    transport
        .write(
            AtCommand::Execute {
                command: command.into(),
            },
            PROBE_TIMEOUT,
        )
        .await
}

async fn read_single_line(transport: &AtTransport, command: &str) -> ModemResult<String> {
    let resp = try_execute(transport, command).await?;
    resp.assert_ok()?;
    for r in &resp.responses {
        if let crate::at::AtResponse::Unknown(s) = r {
            return Ok(s.trim().to_string());
        }
    }
    Ok(String::new())
}

async fn send_pin(transport: &AtTransport, pin: &str) -> ModemResult<()> {
    transport
        .write(
            AtCommand::Equals {
                param: "+CPIN".into(),
                value: AtValue::String(pin.into()),
            },
            PROBE_TIMEOUT,
        )
        .await?
        .assert_ok()
}

/// Step 1 (`ATZ`), with the recovery spec §4.D describes for a failed reset: enable
/// `AT+CMEE=1` (ignoring whether that itself succeeds), unlock the SIM if a PIN was
/// configured, and retry `ATZ` once, propagating whatever that retry returns.
async fn reset_modem(transport: &AtTransport, pin: Option<&str>) -> ModemResult<()> {
    let first = transport
        .write(
            AtCommand::Basic {
                command: "Z".into(),
                number: None,
            },
            PROBE_TIMEOUT,
        )
        .await;
    match first {
        Ok(resp) => resp.assert_ok(),
        Err(e) => {
            warn!(error = %e, "ATZ failed, attempting recovery before retry");
            let _ = transport
                .write(
                    AtCommand::Equals {
                        param: "+CMEE".into(),
                        value: AtValue::Integer(1),
                    },
                    PROBE_TIMEOUT,
                )
                .await;
            if let Some(pin) = pin {
                let _ = send_pin(transport, pin).await;
            }
            transport
                .write(
                    AtCommand::Basic {
                        command: "Z".into(),
                        number: None,
                    },
                    PROBE_TIMEOUT,
                )
                .await?
                .assert_ok()
        }
    }
}

/// Step 5 (`AT+CPIN?`): if the SIM isn't ready and a PIN was configured, send it and
/// re-check, failing with `PinRequired`/`IncorrectPin` only once that's exhausted.
async fn ensure_sim_ready(transport: &AtTransport, pin: Option<&str>) -> ModemResult<()> {
    let status = match transport
        .write(AtCommand::Read { param: "+CPIN".into() }, PROBE_TIMEOUT)
        .await
    {
        Ok(resp) => resp.extract_named_response_opt("+CPIN")?.cloned(),
        Err(ModemError::Cme { code }) if code == cme::NOT_ALLOWED => return Err(ModemError::IncorrectPin),
        // Some modems (Wavecom firmware observed in the field) answer `AT+CPIN?` with
        // `+CPIN: READY` but never send the terminating `OK`, so the read times out. Recover
        // by checking whether the already-buffered partial line says READY before giving up.
        Err(ModemError::Timeout { partial }) if partial.iter().any(|l| l.trim() == "+CPIN: READY") => {
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let Some(AtValue::Unknown(status)) = status else {
        return Ok(());
    };
    if status == "READY" {
        return Ok(());
    }
    let Some(pin) = pin else {
        warn!(status = %status, "SIM not ready and no PIN configured");
        return Err(ModemError::PinRequired);
    };
    send_pin(transport, pin).await?;
    let recheck = transport
        .write(AtCommand::Read { param: "+CPIN".into() }, PROBE_TIMEOUT)
        .await?;
    match recheck.extract_named_response_opt("+CPIN")?.cloned() {
        Some(AtValue::Unknown(s)) if s == "READY" => Ok(()),
        _ => Err(ModemError::IncorrectPin),
    }
}

/// Run the full connect-time capability probe, returning the resolved dialect and
/// capabilities. Steps follow spec §4.D literally: `ATZ` (with failure recovery) → `ATE0` →
/// `AT+CFUN=1` → `AT+CMEE=1` → `AT+CPIN?` (unlocking with `pin` if supplied) → `AT+CLAC` (or
/// interactive per-command probing, if unsupported) → dialect selection → `AT+COPS=3,0` /
/// `AT+CMGF=0` / `AT+CSCA?` / `AT+CSMP=...` → `AT+CPMS=...` → `AT+CNMI=...` → `AT+CLIP=1` /
/// `AT+CRC=1` / `AT+CVHU=0`.
pub async fn probe(transport: &AtTransport, pin: Option<&str>) -> ModemResult<Capabilities> {
    reset_modem(transport, pin).await?;
    transport
        .write(AtCommand::Equals { param: "E".into(), value: AtValue::Integer(0) }, PROBE_TIMEOUT)
        .await?
        .assert_ok()?;
    transport
        .write(
            AtCommand::Equals {
                param: "+CFUN".into(),
                value: AtValue::Integer(1),
            },
            PROBE_TIMEOUT,
        )
        .await?
        .assert_ok()?;
    transport
        .write(
            AtCommand::Equals {
                param: "+CMEE".into(),
                value: AtValue::Integer(1),
            },
            PROBE_TIMEOUT,
        )
        .await?
        .assert_ok()?;

    ensure_sim_ready(transport, pin).await?;

    let manufacturer = read_single_line(transport, "+CGMI").await.unwrap_or_default();
    let model = read_single_line(transport, "+CGMM").await.unwrap_or_default();
    let revision = read_single_line(transport, "+CGMR").await.unwrap_or_default();

    let mut signals = DialectSignals {
        manufacturer: manufacturer.clone(),
        ..Default::default()
    };
    let mut supported_commands = vec![];
    match transport
        .write(AtCommand::Execute { command: "+CLAC".into() }, PROBE_TIMEOUT)
        .await
    {
        Ok(resp) => {
            resp.assert_ok()?;
            signals.has_clac = true;
            for r in &resp.responses {
                if let crate::at::AtResponse::Unknown(s) = r {
                    supported_commands.extend(s.split(',').map(|c| c.trim().to_string()));
                }
            }
        }
        Err(_) => {
            // `AT+CLAC` not supported - fall back to interactive per-command probing for the
            // handful of commands whose presence affects dialect choice.
            signals.has_clac = false;
            for candidate in ["^DTMF", "+WIND", "+ZPAS"] {
                if transport
                    .write(AtCommand::Test { param: candidate.into() }, PROBE_TIMEOUT)
                    .await
                    .is_ok()
                {
                    supported_commands.push(candidate.to_string());
                }
            }
        }
    }
    signals.has_dtmf_caret = supported_commands.iter().any(|c| c == "^DTMF");
    signals.has_wind = supported_commands.iter().any(|c| c == "+WIND");
    signals.has_zpas = supported_commands.iter().any(|c| c == "+ZPAS");
    if !signals.has_zpas {
        signals.zpas_query_ok = transport
            .write(AtCommand::Read { param: "+ZPAS".into() }, PROBE_TIMEOUT)
            .await
            .is_ok();
    }

    let dialect = dialect::detect(&signals);
    let simcom_dtmf = dialect::enables_simcom_dtmf(&signals);
    if simcom_dtmf {
        let _ = transport
            .write(
                AtCommand::Equals {
                    param: "+DDET".into(),
                    value: AtValue::Integer(1),
                },
                PROBE_TIMEOUT,
            )
            .await;
    }
    info!(?dialect, manufacturer = %manufacturer, "resolved modem dialect");

    transport
        .write(
            AtCommand::Equals {
                param: "+COPS".into(),
                value: AtValue::Array(vec![AtValue::Integer(3), AtValue::Integer(0)]),
            },
            PROBE_TIMEOUT,
        )
        .await?
        .assert_ok()?;
    transport
        .write(
            AtCommand::Equals {
                param: "+CMGF".into(),
                value: AtValue::Integer(0),
            },
            PROBE_TIMEOUT,
        )
        .await?
        .assert_ok()?;
    let _ = transport
        .write(AtCommand::Read { param: "+CSCA".into() }, PROBE_TIMEOUT)
        .await;
    let _ = transport
        .write(
            AtCommand::Text {
                text: "AT+CSMP=17,167,0,0".into(),
                expected: vec!["+CSMP".into()],
            },
            PROBE_TIMEOUT,
        )
        .await;
    let _ = transport
        .write(
            AtCommand::Text {
                text: "AT+CPMS=\"SM\",\"SM\",\"SM\"".into(),
                expected: vec!["+CPMS".into()],
            },
            PROBE_TIMEOUT,
        )
        .await;
    transport
        .write(
            AtCommand::Text {
                text: "AT+CNMI=2,1,2,1,0".into(),
                expected: vec!["+CNMI".into()],
            },
            PROBE_TIMEOUT,
        )
        .await?
        .assert_ok()?;

    let supports_clip = transport
        .write(
            AtCommand::Equals {
                param: "+CLIP".into(),
                value: AtValue::Integer(1),
            },
            PROBE_TIMEOUT,
        )
        .await
        .map(|r| r.assert_ok().is_ok())
        .unwrap_or(false);
    let supports_crc = transport
        .write(
            AtCommand::Equals {
                param: "+CRC".into(),
                value: AtValue::Integer(1),
            },
            PROBE_TIMEOUT,
        )
        .await
        .map(|r| r.assert_ok().is_ok())
        .unwrap_or(false);
    let supports_cvhu = transport
        .write(
            AtCommand::Equals {
                param: "+CVHU".into(),
                value: AtValue::Integer(0),
            },
            PROBE_TIMEOUT,
        )
        .await
        .map(|r| r.assert_ok().is_ok())
        .unwrap_or(false);

    debug!(commands = ?supported_commands, "probe complete");
    Ok(Capabilities {
        manufacturer,
        model,
        revision,
        dialect,
        has_clac: signals.has_clac,
        supported_commands,
        simcom_dtmf,
        supports_clip,
        supports_crc,
        supports_cvhu,
    })
}
