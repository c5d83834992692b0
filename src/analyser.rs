//! Request classifier, response reassembler and telemetry parser for the
//! boiler's line-oriented ASCII/Latin-1 command protocol.
//!
//! One [`Analyser`] lives for the lifetime of a TelnetProxy session. Requests
//! are stateless to classify; responses need the Analyser's own buffers to
//! reassemble multi-chunk arrivals, so [`Analyser::process_response_chunk`]
//! takes and returns the caller's [`Mode`]/[`CommandState`] pair rather than
//! owning them — the TelnetProxy's `SessionState` is the source of truth.

use crate::boiler_parameter::BoilerParameter;
use crate::latin1;
use crate::pubsub::PubSub;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const INFO_CHANNEL: &str = "info";
const TRACK_CHANNEL: &str = "track";

/// The request-state tag, set while classifying an IGW request and consumed
/// while parsing the matching boiler response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    LoginToken,
    LoginKey,
    ApiVersion,
    SetKomm,
    AsnrGet,
    IgwSet,
    IgwClear,
    DaqStop,
    LoggingDisable,
    DaqDesc,
    DaqStart,
    LoggingEnable,
    BootVersion,
    Info,
    Uptime,
    RtcGet,
    ParGetAll,
    ParGetChanged,
    ParGet,
    ErrAct,
    /// Recognised by neither the request nor response table; still forwarded.
    Passthrough,
}

/// Response reassembly mode (§3 SessionState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// No response in flight; the next chunk starts a new one.
    #[default]
    Ready,
    /// Accumulating a normal (CRLF-terminated) response across reads.
    Assembling,
    /// Accumulating a streaming `pm` telemetry frame.
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub state: CommandState,
    /// True when `$igw clear` was seen — the vendor's explicit logout.
    pub session_end_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseOutcome {
    pub mode: Mode,
    pub state: CommandState,
    pub login_done: bool,
    pub session_end_complete: bool,
}

pub struct Analyser {
    bus: PubSub,
    scan_period: Duration,
    telemetry_map: HashMap<usize, String>,
    pm_buffer: Vec<u8>,
    pm_last_accepted: Option<Instant>,
    pm_values: HashMap<i64, String>,
}

impl Analyser {
    pub fn new(bus: PubSub, scan_period: Duration, telemetry_map: &[(usize, String)]) -> Self {
        Analyser {
            bus,
            scan_period,
            telemetry_map: telemetry_map.iter().cloned().collect(),
            pm_buffer: Vec::new(),
            pm_last_accepted: None,
            pm_values: HashMap::new(),
        }
    }

    fn push(&self, key: &str, value: &str) {
        self.bus.publish(INFO_CHANNEL, format!("{key}££{value}"));
    }

    /// Classify one IGW request chunk. A chunk with no trailing CRLF is
    /// still tagged (`Passthrough` if otherwise unrecognised) — classifying
    /// never withholds a forward, that happens unconditionally by the caller.
    pub fn parse_request(&self, data: &[u8]) -> RequestOutcome {
        let text = latin1::decode(data);
        let mut state = CommandState::Idle;
        let mut session_end_requested = false;

        for part in text.split("\r\n") {
            if part.is_empty() {
                continue;
            }
            if let Some(rest) = part.strip_prefix("$login key") {
                state = CommandState::LoginKey;
                self.push("KEY", rest.get(1..).unwrap_or("").trim_start());
            } else if part.starts_with("$login token") {
                state = CommandState::LoginToken;
            } else if part.starts_with("$apiversion") {
                state = CommandState::ApiVersion;
            } else if part.starts_with("$setkomm") {
                state = CommandState::SetKomm;
            } else if part.starts_with("$asnr get") {
                state = CommandState::AsnrGet;
            } else if let Some(rest) = part.strip_prefix("$igw set") {
                state = CommandState::IgwSet;
                self.push("IGW", rest.get(1..).unwrap_or("").trim_start());
            } else if part.starts_with("$igw clear") {
                state = CommandState::IgwClear;
                session_end_requested = true;
            } else if part.starts_with("$daq stop") {
                state = CommandState::DaqStop;
            } else if part.starts_with("$logging disable") {
                state = CommandState::LoggingDisable;
            } else if part.starts_with("$daq desc") {
                state = CommandState::DaqDesc;
            } else if part.starts_with("$daq start") {
                state = CommandState::DaqStart;
            } else if part.starts_with("$logging enable") {
                state = CommandState::LoggingEnable;
            } else if part.starts_with("$bootversion") {
                state = CommandState::BootVersion;
            } else if part.starts_with("$info") {
                state = CommandState::Info;
            } else if part.starts_with("$uptime") {
                state = CommandState::Uptime;
            } else if part.starts_with("$rtc get") {
                state = CommandState::RtcGet;
            } else if part.starts_with("$par get all") {
                state = CommandState::ParGetAll;
            } else if part.starts_with("$par get changed") {
                state = CommandState::ParGetChanged;
            } else if part.starts_with("$par get") {
                state = CommandState::ParGet;
            } else if part.starts_with("$erract") {
                state = CommandState::ErrAct;
            } else {
                state = CommandState::Passthrough;
            }
        }

        RequestOutcome { state, session_end_requested }
    }

    /// Feed one chunk of boiler response bytes through reassembly. Returns
    /// the updated mode/state plus the two special signals TelnetProxy acts
    /// on (login-complete, session-end-complete).
    pub fn process_response_chunk(
        &mut self,
        chunk: &[u8],
        mode: Mode,
        state: CommandState,
        session_end_requested: bool,
        buffer: &mut Vec<u8>,
    ) -> ResponseOutcome {
        let mut mode = mode;
        if mode != Mode::Streaming && is_pm_response(chunk) {
            mode = Mode::Streaming;
        }

        if mode == Mode::Streaming {
            self.pm_buffer.extend_from_slice(chunk);
            if chunk.ends_with(b"\r\n") {
                let now = Instant::now();
                let accept = match self.pm_last_accepted {
                    None => true,
                    Some(last) => now.duration_since(last) > self.scan_period,
                };
                if accept {
                    let frame = self.pm_buffer.clone();
                    self.analyse_pm(&frame);
                    self.pm_last_accepted = Some(now);
                }
                self.pm_buffer.clear();
                mode = Mode::Ready;
            }
            return ResponseOutcome { mode, state, login_done: false, session_end_complete: false };
        }

        if !chunk.ends_with(b"\r\n") {
            mode = Mode::Assembling;
        }
        if mode == Mode::Assembling {
            buffer.extend_from_slice(chunk);
        } else {
            buffer.clear();
            buffer.extend_from_slice(chunk);
        }

        if !buffer.ends_with(b"\r\n") {
            return ResponseOutcome { mode, state, login_done: false, session_end_complete: false };
        }

        mode = Mode::Ready;
        let mut login_done = false;
        let mut session_end_complete = false;
        let mut next_state = state;

        if is_daq_desc(buffer) {
            // The DAQ project schema can arrive unsolicited relative to the
            // request/response state machine; discard whatever state we
            // were tracking and drop the buffer without publishing it.
            next_state = CommandState::Idle;
        } else {
            self.bus.publish(TRACK_CHANNEL, latin1::decode(buffer));
            let outcome = self.parse_response_buffer(state, buffer, session_end_requested);
            next_state = outcome.0;
            login_done = outcome.1;
            session_end_complete = outcome.2;
        }
        buffer.clear();

        ResponseOutcome { mode, state: next_state, login_done, session_end_complete }
    }

    fn parse_response_buffer(
        &self,
        state: CommandState,
        buffer: &[u8],
        session_end_requested: bool,
    ) -> (CommandState, bool, bool) {
        let text = latin1::decode(buffer);
        let mut state = state;
        let mut login_done = false;
        let mut session_end_complete = false;

        for part in text.split("\r\n") {
            if part.is_empty() {
                continue;
            }
            match state {
                CommandState::LoginToken => {
                    self.push("TOKEN", part.get(1..).unwrap_or(""));
                    state = CommandState::Idle;
                }
                CommandState::LoginKey => {
                    if part.contains("zclient login") {
                        login_done = true;
                    }
                    if part.starts_with("$ack") {
                        state = CommandState::Idle;
                    }
                }
                CommandState::ApiVersion => {
                    if let Some(rest) = part.strip_prefix('$') {
                        self.push("API", rest);
                        state = CommandState::Idle;
                    }
                }
                CommandState::SetKomm => {
                    if part.contains("ack") {
                        let trimmed = part.get(1..part.len().saturating_sub(4)).unwrap_or("");
                        self.push("SETKOMM", trimmed);
                        state = CommandState::Idle;
                    }
                }
                CommandState::AsnrGet => {
                    if let Some(rest) = part.strip_prefix('$') {
                        self.push("ASNR", rest);
                        state = CommandState::Idle;
                    }
                }
                CommandState::IgwSet => {
                    if part.contains("ack") {
                        state = CommandState::Idle;
                    }
                }
                CommandState::IgwClear => {
                    if part.contains("$ack") {
                        if session_end_requested {
                            session_end_complete = true;
                        }
                        state = CommandState::Idle;
                    }
                }
                _ if part.contains("$daq stopped") => state = CommandState::Idle,
                _ if part.contains("logging disabled") => state = CommandState::Idle,
                CommandState::DaqDesc => {
                    if part.starts_with("$<<") && part.ends_with(">>") {
                        state = CommandState::Idle;
                    }
                }
                _ if part.contains("daq started") => state = CommandState::Idle,
                _ if part.contains("logging enabled") => state = CommandState::Idle,
                CommandState::BootVersion => {
                    if let Some(rest) = part.strip_prefix("$V") {
                        self.push("BOOT", rest);
                        state = CommandState::Idle;
                    }
                }
                CommandState::Info => {
                    if let Some(rest) = part.strip_prefix("$KT:") {
                        self.push("KT", rest.trim_start());
                    }
                    if let Some(rest) = part.strip_prefix("$SWV:") {
                        self.push("SWV", rest.trim_start());
                    }
                    if let Some(rest) = part.strip_prefix("$FWV I/O:") {
                        self.push("FWV", rest.trim_start());
                    }
                    if let Some(rest) = part.strip_prefix("$SN I/O:") {
                        self.push("SNIO", rest.trim_start());
                    }
                    if let Some(rest) = part.strip_prefix("$SN BCE:") {
                        self.push("SNBCE", rest.trim_start());
                        state = CommandState::Idle;
                    }
                }
                CommandState::Uptime => {
                    if let Some(rest) = part.strip_prefix('$') {
                        self.push("UPTIME", rest);
                        state = CommandState::Idle;
                    }
                }
                CommandState::RtcGet => {
                    if let Some(rest) = part.strip_prefix('$') {
                        self.push("RTC", rest);
                        state = CommandState::Idle;
                    }
                }
                CommandState::ParGetChanged => {
                    if part == "$--" {
                        state = CommandState::Idle;
                    }
                }
                CommandState::ParGet => {
                    if part.starts_with('$') {
                        if let Ok(param) = BoilerParameter::parse_line(part) {
                            self.push(param.id(), &param.to_line());
                        }
                        state = CommandState::Idle;
                    }
                }
                CommandState::ParGetAll | CommandState::ErrAct => {
                    state = CommandState::Idle;
                }
                _ => {
                    state = CommandState::Idle;
                }
            }
        }

        (state, login_done, session_end_complete)
    }

    /// Parse a complete `pm <v0> <v1> … <vn>\r\n` frame and publish any
    /// configured index whose value changed since the last frame.
    fn analyse_pm(&mut self, pm: &[u8]) {
        let text = latin1::decode(pm);
        let mut index: i64 = -1;
        for part in text.trim_end_matches(['\r', '\n']).split(' ') {
            let changed = match self.pm_values.get(&index) {
                Some(prev) => prev != part,
                None => true,
            };
            if changed {
                self.pm_values.insert(index, part.to_owned());
                if index >= 0 {
                    if let Some(key) = self.telemetry_map.get(&(index as usize)) {
                        self.push(key, part);
                    }
                }
            }
            index += 1;
        }
    }
}

fn is_pm_response(data: &[u8]) -> bool {
    data.len() > 1 && &data[0..2] == b"pm"
}

fn is_daq_desc(buffer: &[u8]) -> bool {
    buffer.len() > 4 && &buffer[0..4] == b"$<<<"
}
