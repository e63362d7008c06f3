//! Barrett HF/ALE radio state machine.
//!
//! This module is pure protocol logic: no serial I/O, no sleeping. It
//! consumes bytes read from the modem, turns them into terminated lines,
//! interprets the handful of `AI*`/`EV*` responses the 2050 ALE command set
//! produces, and builds the framed `AXNMSG` commands used to push a
//! fragment out. The [`crate::radio::RadioDriver`] adapter that owns an
//! actual `serialport::SerialPort` lives alongside it and drives this state
//! machine from real reads/writes.

pub const FRAGMENT_PAYLOAD_BYTES: usize = 43;
pub const MAX_FRAGMENTS: usize = 6;
pub const SEND_ABSOLUTE_TIMEOUT_MS: i64 = 90_000;
const LINK_ESTABLISHMENT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HfState {
    Disconnected,
    CallRequested,
    Connecting,
    AleLink,
    Disconnecting,
    AleSending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Xon,
    Xoff,
}

#[derive(Debug, Clone)]
pub struct Station {
    pub name: String,
    pub index: String,
    pub consecutive_connection_failures: u32,
}

/// What happened as a result of feeding one complete line into
/// [`BarrettProtocol::process_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    None,
    /// The modem reported a syntax error while we had a call outstanding.
    CallRequestFailed,
    /// No reply was received for an outstanding call.
    CallNoAnswer,
    /// The station table (`AIATBL`) was refreshed.
    StationTableUpdated,
    /// A complete ALE AMD fragment arrived; hex-encoded payload attached.
    AmdFragment(String),
    /// The link table reports we now hold a link with the given partner
    /// index string (already byte-swapped per the original's layout).
    LinkEstablished { partner_index: Option<usize> },
    /// The link table reports the link has gone away.
    LinkLost,
    /// `AISTAT<a><b>` was parsed; carries the resulting `ale_inprogress`
    /// value (0 idle, 1 tx, 2 rx) so a send loop can detect the modem
    /// dropping back to idle, or another incoming message, mid-send.
    StatusUpdated { ale_inprogress: u8 },
    /// `AIMESS1`: the modem accepted the most recently written fragment.
    FragmentAccepted,
}

/// A single outbound `AXNMSG` frame, ready to be written to the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(pub String);

pub struct BarrettProtocol {
    pub state: HfState,
    previous_state: Option<HfState>,
    /// 0 = idle, 1 = transmitting, 2 = receiving (mirrors `ale_inprogress`).
    pub ale_inprogress: u8,
    pub link_partner: Option<usize>,
    link_partner_string: String,
    pub stations: Vec<Station>,
    self_index: String,
    pub message_failure: u32,
    pub pause_tx: PauseState,
    line_buf: String,
    send_seq: u8,
    last_link_probe_ms: i64,
    next_call_time_ms: i64,
    last_outbound_call_ms: i64,
}

impl BarrettProtocol {
    pub fn new(self_index: impl Into<String>) -> Self {
        BarrettProtocol {
            state: HfState::Disconnected,
            previous_state: None,
            ale_inprogress: 0,
            link_partner: None,
            link_partner_string: String::new(),
            stations: Vec::new(),
            self_index: self_index.into(),
            message_failure: 0,
            pause_tx: PauseState::Xoff,
            line_buf: String::new(),
            send_seq: 0,
            last_link_probe_ms: 0,
            next_call_time_ms: 0,
            last_outbound_call_ms: 0,
        }
    }

    pub fn link_partner_string(&self) -> &str {
        &self.link_partner_string
    }

    /// Mirrors `hfbarrett_ready_test`.
    pub fn ready(&self) -> bool {
        self.state == HfState::AleLink
            && self.ale_inprogress == 0
            && !self.link_partner_string.is_empty()
    }

    /// Feeds raw bytes read from the modem, tracking XON/XOFF flow-control
    /// bytes and splitting on CR/LF, returning every complete line seen.
    pub fn receive_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match b {
                0x11 => self.pause_tx = PauseState::Xon,
                0x13 => self.pause_tx = PauseState::Xoff,
                _ => {}
            }
            if b == 13 || b == 10 {
                if !self.line_buf.is_empty() {
                    lines.push(std::mem::take(&mut self.line_buf));
                }
            } else if self.line_buf.len() < 1024 {
                self.line_buf.push(b as char);
            }
        }
        lines
    }

    /// Advances the per-state machinery on a roughly-once-a-second tick;
    /// returns any command the caller should write to the modem. Mirrors
    /// `hfbarrett_serviceloop` minus the actual blocking I/O.
    pub fn tick(&mut self, now_ms: i64, station_count: usize) -> Option<Frame> {
        let now_secs = now_ms / 1000;
        let mut out = None;

        match self.state {
            HfState::Disconnected => {
                if now_ms < self.last_outbound_call_ms {
                    // Not yet allowed our first call.
                } else if self.ale_inprogress == 2 {
                    // Another radio is mid-call; don't compete.
                } else if self.link_partner.is_none()
                    && station_count > 0
                    && now_secs >= self.next_call_time_ms / 1000
                {
                    if let Some(next) = self.next_station_to_call() {
                        let partner = self.stations[next].index.clone();
                        out = Some(Frame(format!(
                            "AXNMSG{partner}{self_idx}CONNECTING\r\n",
                            self_idx = self.self_index
                        )));
                        self.state = HfState::CallRequested;
                        self.next_call_time_ms = now_ms + LINK_ESTABLISHMENT_SECS * 1000;
                    }
                } else if self.link_partner.is_some() {
                    self.state = HfState::AleLink;
                } else if now_secs != self.last_link_probe_ms / 1000 {
                    out = Some(Frame("AILTBL\r\n".to_string()));
                    self.last_link_probe_ms = now_ms;
                }
            }
            HfState::CallRequested => {
                if now_secs != self.last_link_probe_ms / 1000 {
                    out = Some(Frame("AILTBL\r\n".to_string()));
                    self.last_link_probe_ms = now_ms;
                }
                if self.ale_inprogress == 2 {
                    self.state = HfState::Disconnected;
                } else if now_ms >= self.next_call_time_ms {
                    self.state = HfState::Disconnected;
                }
            }
            HfState::AleLink => {
                if self.previous_state.is_none() {
                    // First tick ever, and already linked: we never saw
                    // this link get established, so it may be a stale
                    // leftover from before the process started. Treat it
                    // as untrustworthy and force a fresh ALE negotiation.
                    tracing::info!("link present on first tick; treating as stale");
                    self.state = HfState::Disconnected;
                } else {
                    if self.previous_state == Some(HfState::Disconnected) {
                        tracing::info!("link appeared unsolicited; pausing for turnaround");
                    }
                    if self.message_failure > 10 {
                        out = Some(Frame("*".to_string()));
                        self.message_failure = 0;
                    }
                }
            }
            HfState::Connecting | HfState::Disconnecting | HfState::AleSending => {}
        }

        if self.previous_state != Some(self.state) {
            tracing::info!(?self.state, "Barrett radio changed state");
            self.previous_state = Some(self.state);
        }

        out
    }

    fn next_station_to_call(&self) -> Option<usize> {
        self.stations
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.consecutive_connection_failures)
            .map(|(i, _)| i)
    }

    /// Mirrors `hfbarrett_process_line`: interprets one already-trimmed
    /// line of modem output and applies any resulting state transition.
    pub fn process_line(&mut self, line: &str) -> LineEvent {
        let line = line.trim();
        tracing::trace!(?self.state, line, "barrett radio line");

        if line == "EV00" && self.state == HfState::CallRequested {
            self.next_call_time_ms = 0;
            self.state = HfState::Disconnected;
            return LineEvent::CallRequestFailed;
        }
        if line == "E0" && self.state == HfState::CallRequested {
            self.next_call_time_ms = 0;
            self.state = HfState::Disconnected;
            return LineEvent::CallRequestFailed;
        }
        if line == "EV08" && self.state == HfState::CallRequested {
            self.state = HfState::Disconnected;
            return LineEvent::CallRequestFailed;
        }

        if let Some(rest) = line.strip_prefix("AIATBL") {
            let _ = rest;
            return LineEvent::StationTableUpdated;
        }

        if let Some(payload) = line.strip_prefix("AIAMDM") {
            self.message_failure = 0;
            return LineEvent::AmdFragment(payload.to_string());
        }

        if let Some(digits) = line.strip_prefix("AISTAT") {
            let bytes: Vec<char> = digits.chars().collect();
            if let Some(&c0) = bytes.first() {
                self.ale_inprogress = match c0 {
                    '0' => 0,
                    '1' => 1,
                    '2' => 2,
                    _ => self.ale_inprogress,
                };
            }
            if let (Some(&c0), Some(&c1)) = (bytes.first(), bytes.get(1)) {
                if c0 == '2' && c1 == '0' && self.state == HfState::AleLink {
                    self.message_failure += 1;
                }
            }
            return LineEvent::StatusUpdated {
                ale_inprogress: self.ale_inprogress,
            };
        }

        if line == "AIMESS1" {
            return LineEvent::FragmentAccepted;
        }

        if line == "AILTBL" && self.state == HfState::AleLink {
            if let Some(partner) = self.link_partner {
                self.stations[partner].consecutive_connection_failures += 1;
            }
            self.link_partner = None;
            self.ale_inprogress = 0;
            self.state = HfState::Disconnected;
            return LineEvent::LinkLost;
        }

        if let Some(rest) = line.strip_prefix("AILTBL") {
            if self.state != HfState::AleLink && rest.len() >= 6 {
                let chars: Vec<char> = rest.chars().collect();
                // Byte-swapped per the original: [4],[5],[2],[3].
                let link_string: String = [chars[4], chars[5], chars[2], chars[3]]
                    .iter()
                    .collect();
                self.link_partner_string = link_string.clone();

                let mut matched = None;
                for (i, station) in self.stations.iter().enumerate() {
                    let expected = format!("{}{}", station.index, self.self_index);
                    if link_string == expected {
                        matched = Some(i);
                        break;
                    }
                }
                if let Some(i) = matched {
                    self.stations[i].consecutive_connection_failures = 0;
                }
                self.link_partner = matched;
                self.state = HfState::AleLink;
                return LineEvent::LinkEstablished {
                    partner_index: matched,
                };
            }
        }

        if line == "AIMESS3" && self.state == HfState::CallRequested {
            self.state = HfState::Disconnected;
            return LineEvent::CallNoAnswer;
        }

        LineEvent::None
    }

    /// Splits `payload` into up to [`MAX_FRAGMENTS`] `AXNMSG`-framed
    /// fragments of at most [`FRAGMENT_PAYLOAD_BYTES`] bytes each, hex
    /// encoding the payload and prefixing a 3-byte header of (sequence,
    /// index, total-piece-count). Returns `None` if the payload doesn't
    /// fit in [`MAX_FRAGMENTS`] pieces.
    pub fn build_fragments(&mut self, partner_index: &str, payload: &[u8]) -> Option<Vec<Frame>> {
        let pieces = payload.len().div_ceil(FRAGMENT_PAYLOAD_BYTES).max(1);
        if pieces > MAX_FRAGMENTS {
            return None;
        }

        let mut frames = Vec::with_capacity(pieces);
        for (piece_index, chunk) in payload.chunks(FRAGMENT_PAYLOAD_BYTES).enumerate() {
            let header = [
                (0x41 + (self.send_seq & 0x07)) as char,
                (0x30 + piece_index as u8) as char,
                (0x30 + pieces as u8) as char,
            ];
            let hex: String = chunk.iter().map(|b| format!("{b:02x}")).collect();
            let fragment: String = header.iter().collect::<String>() + &hex;
            frames.push(Frame(format!(
                "AXNMSG{partner_index}{len:02}{fragment}\r\n",
                len = fragment.len()
            )));
        }
        self.send_seq = self.send_seq.wrapping_add(1);
        Some(frames)
    }
}

/// [`RadioDriver`](crate::radio::RadioDriver) adapter that drives
/// [`BarrettProtocol`] from a real serial port.
pub struct BarrettSerialDriver {
    port: Box<dyn serialport::SerialPort>,
    protocol: BarrettProtocol,
}

impl BarrettSerialDriver {
    pub fn open(device: &str, baud: u32, self_index: impl Into<String>) -> anyhow::Result<Self> {
        let port = serialport::new(device, baud)
            .timeout(std::time::Duration::from_millis(50))
            .open()?;
        let mut driver = BarrettSerialDriver {
            port,
            protocol: BarrettProtocol::new(self_index),
        };
        driver.send_setup_commands()?;
        Ok(driver)
    }

    /// Issues the registration commands the modem needs to report AMD
    /// messages, link table changes, and call events.
    fn send_setup_commands(&mut self) -> anyhow::Result<()> {
        const SETUP: &[&str] = &[
            "AIATBL\r\n",
            "ARAMDM1\r\n",
            "ARAMDP1\r\n",
            "ARCALL1\r\n",
            "ARLINK1\r\n",
            "ARLTBL1\r\n",
            "ARMESS1\r\n",
            "ARSTAT1\r\n",
            "AXALRM0\r\n",
            "AILTBL\r\n",
        ];
        for cmd in SETUP {
            self.port.write_all(cmd.as_bytes())?;
        }
        Ok(())
    }

    pub fn stations_mut(&mut self) -> &mut Vec<Station> {
        &mut self.protocol.stations
    }
}

impl crate::radio::RadioDriver for BarrettSerialDriver {
    fn name(&self) -> &'static str {
        "hfbarrett"
    }

    fn ready(&self) -> bool {
        self.protocol.ready()
    }

    fn service(
        &mut self,
        max_block: std::time::Duration,
        on_receive: &mut dyn FnMut(&[u8]),
    ) -> anyhow::Result<crate::radio::ServiceResult> {
        use std::io::{ErrorKind, Read, Write};

        let mut progressed = false;
        self.port.set_timeout(max_block)?;

        let mut buf = [0u8; 4096];
        match self.port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for line in self.protocol.receive_bytes(&buf[..n]) {
                    let event = self.protocol.process_line(&line);
                    if let LineEvent::AmdFragment(payload) = event {
                        on_receive(payload.as_bytes());
                    }
                    progressed = true;
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }

        let station_count = self.protocol.stations.len();
        if let Some(frame) = self.protocol.tick(crate::gettime_ms(), station_count) {
            self.port.write_all(frame.0.as_bytes())?;
            progressed = true;
        }

        Ok(if progressed {
            crate::radio::ServiceResult::Progressed
        } else {
            crate::radio::ServiceResult::Idle
        })
    }

    /// Sends one outbound packet, fragmenting it and driving each fragment
    /// through the modem's accept/reject handshake per `hfbarrett_send`:
    /// refuse immediately if the link isn't ready, otherwise retry each
    /// fragment (subject to flow control and jitter) until it is accepted
    /// or the 90-second absolute budget for the whole packet expires.
    fn send_packet(&mut self, packet: &[u8]) -> anyhow::Result<bool> {
        if !self.protocol.ready() {
            return Ok(false);
        }
        let partner = self.protocol.link_partner_string().to_string();
        let Some(frames) = self.protocol.build_fragments(&partner, packet) else {
            return Ok(false);
        };

        let deadline_ms = crate::gettime_ms() + SEND_ABSOLUTE_TIMEOUT_MS;
        for frame in &frames {
            match self.send_fragment(frame, deadline_ms)? {
                FragmentResult::Accepted => {
                    std::thread::sleep(std::time::Duration::from_secs(3));
                }
                FragmentResult::Aborted => {
                    self.write_line("AXABORT\r\n")?;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Outcome of driving a single fragment through the modem's handshake.
enum FragmentResult {
    Accepted,
    Aborted,
}

impl BarrettSerialDriver {
    fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        use std::io::Write;
        self.port.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Reads whatever the modem sends for up to `window`, assembling lines
    /// and feeding each through the protocol's line processor.
    fn poll_events(&mut self, window: std::time::Duration) -> anyhow::Result<Vec<LineEvent>> {
        use std::io::{ErrorKind, Read};

        self.port.set_timeout(window)?;
        let mut buf = [0u8; 4096];
        let mut events = Vec::new();
        match self.port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for line in self.protocol.receive_bytes(&buf[..n]) {
                    events.push(self.protocol.process_line(&line));
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
        Ok(events)
    }

    /// Drives one already-framed fragment to acceptance or failure,
    /// mirroring the original's per-fragment retry loop: drain pending
    /// modem chatter, back off one second at a time while XOFF holds,
    /// otherwise jitter and write, then poll for up to a second at a time
    /// for `AIMESS1` (accepted), a drop back to idle mid-send (aborted,
    /// retry this fragment fails), or another incoming message (aborted,
    /// the whole packet fails).
    fn send_fragment(&mut self, frame: &Frame, deadline_ms: i64) -> anyhow::Result<FragmentResult> {
        let mut was_transmitting = false;

        while crate::gettime_ms() < deadline_ms {
            // Drain anything pending before deciding whether to (re)send.
            self.poll_events(std::time::Duration::from_millis(20))?;

            if self.protocol.pause_tx == PauseState::Xoff {
                std::thread::sleep(std::time::Duration::from_secs(1));
                continue;
            }

            let jitter_ms = rand::random::<u64>() % 3001;
            std::thread::sleep(std::time::Duration::from_millis(jitter_ms));
            self.write_line(&frame.0)?;

            let poll_until = std::cmp::min(deadline_ms, crate::gettime_ms() + 1000);
            while crate::gettime_ms() < poll_until {
                let remaining =
                    (poll_until - crate::gettime_ms()).clamp(0, 1000) as u64;
                for event in self.poll_events(std::time::Duration::from_millis(remaining))? {
                    match event {
                        LineEvent::FragmentAccepted => return Ok(FragmentResult::Accepted),
                        LineEvent::StatusUpdated { ale_inprogress } => match ale_inprogress {
                            1 => was_transmitting = true,
                            0 if was_transmitting => return Ok(FragmentResult::Aborted),
                            2 => return Ok(FragmentResult::Aborted),
                            _ => {}
                        },
                        _ => {}
                    }
                }
            }
        }

        Ok(FragmentResult::Aborted)
    }
}
