//! Companion-side device scan
//!
//! The companion module scans its own radio on request and streams the result
//! back as ASCII over the scan-list characteristic: first the expected device
//! count as a decimal string, then newline-separated names in arbitrary
//! fragments. A session ends on whichever of these comes first:
//!
//! - the number of distinct names reaches the announced count
//! - a fragment contains a NUL byte
//! - the scan-state characteristic reports a state containing `R`
//! - the session timeout elapses (handled by the engine)
//!
//! [`ScanListParser`] tracks one session at a time and finalizes it exactly once.

use crate::types::DeviceRecord;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};

/// Command byte that starts a companion-side scan
pub const SCAN_TRIGGER: u8 = b'c';

/// Marker in a scan-state notification meaning the scan is complete
pub const SCAN_READY_MARKER: char = 'R';

const SESSION_END: char = '\u{0}';

/// Ordered, de-duplicated scan result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRoster {
    pub devices: Vec<DeviceRecord>,
}

impl ScanRoster {
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceRecord> {
        self.devices.get(index)
    }
}

/// Roster update produced by the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterUpdate {
    pub roster: ScanRoster,
    pub complete: bool,
}

/// Why a scan session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EmptyCount,
    CountReached,
    EndMarker,
    ReadyState,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    AwaitingCount,
    Collecting { expected: Option<usize> },
    Finished,
}

/// Incremental parser for the streamed device list
#[derive(Debug)]
pub struct ScanListParser {
    state: SessionState,
    buffer: String,
    /// Names last reported to the caller, to suppress duplicate updates
    reported: Vec<String>,
    known_addresses: HashMap<String, String>,
    last_roster: ScanRoster,
}

impl Default for ScanListParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanListParser {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            buffer: String::new(),
            reported: Vec::new(),
            known_addresses: HashMap::new(),
            last_roster: ScanRoster::default(),
        }
    }

    /// Start a new session, discarding the previous roster and buffer
    pub fn begin_session(&mut self) {
        self.state = SessionState::AwaitingCount;
        self.buffer.clear();
        self.reported.clear();
        self.last_roster = ScanRoster::default();
    }

    /// Forget the session and roster of a previous link. Known addresses stay.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.buffer.clear();
        self.reported.clear();
        self.last_roster = ScanRoster::default();
    }

    /// Whether a session is open and not yet finalized
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::AwaitingCount | SessionState::Collecting { .. }
        )
    }

    /// The most recent roster (provisional or final)
    pub fn roster(&self) -> &ScanRoster {
        &self.last_roster
    }

    /// Remember a real address for a device name, e.g. from a local radio scan
    pub fn remember_address(&mut self, name: &str, address: &str) {
        self.known_addresses
            .insert(name.trim().to_string(), address.to_string());
    }

    /// Feed one scan-list notification
    pub fn on_fragment(&mut self, bytes: &[u8]) -> Option<RosterUpdate> {
        if !self.is_active() {
            // Fragments from a module-initiated scan open a session implicitly
            if self.state == SessionState::Idle {
                debug!("Scan data without a pending request; opening a session");
                self.begin_session();
            } else {
                debug!("Ignoring {} scan bytes after finalization", bytes.len());
                return None;
            }
        }

        let fragment = String::from_utf8_lossy(bytes);
        let mut data: &str = &fragment;

        if self.state == SessionState::AwaitingCount {
            let (head, rest) = match fragment.split_once('\n') {
                Some((head, rest)) => (head, rest),
                None => (&fragment[..], ""),
            };
            let candidate = head.trim_matches(|c: char| c.is_whitespace() || c == SESSION_END);
            match candidate.parse::<usize>() {
                Ok(0) => {
                    info!("Companion reports an empty scan");
                    return Some(self.finish(FinishReason::EmptyCount));
                }
                Ok(count) => {
                    debug!("Companion announces {} devices", count);
                    self.state = SessionState::Collecting {
                        expected: Some(count),
                    };
                    data = rest;
                }
                Err(_) => {
                    warn!("Scan list did not start with a device count; collecting anyway");
                    self.state = SessionState::Collecting { expected: None };
                }
            }
        }

        self.buffer.push_str(data);

        if fragment.contains(SESSION_END) {
            return Some(self.finish(FinishReason::EndMarker));
        }

        let names = Self::complete_names(&self.buffer);
        if let SessionState::Collecting {
            expected: Some(expected),
        } = self.state
        {
            if names.len() >= expected {
                return Some(self.finish(FinishReason::CountReached));
            }
        }

        if names == self.reported {
            return None;
        }
        self.reported = names.clone();
        self.last_roster = self.build_roster(&names);
        Some(RosterUpdate {
            roster: self.last_roster.clone(),
            complete: false,
        })
    }

    /// Feed one scan-state notification
    pub fn on_scan_state(&mut self, bytes: &[u8]) -> Option<RosterUpdate> {
        let state = String::from_utf8_lossy(bytes);
        debug!("Companion scan state: {:?}", state);
        if self.is_active() && state.contains(SCAN_READY_MARKER) {
            return Some(self.finish(FinishReason::ReadyState));
        }
        None
    }

    /// Finalize because the session bound elapsed
    pub fn on_timeout(&mut self) -> Option<RosterUpdate> {
        if !self.is_active() {
            return None;
        }
        Some(self.finish(FinishReason::Timeout))
    }

    fn finish(&mut self, reason: FinishReason) -> RosterUpdate {
        let names = Self::all_names(&self.buffer);
        self.last_roster = self.build_roster(&names);
        self.state = SessionState::Finished;
        self.buffer.clear();
        self.reported.clear();
        info!(
            "Scan finished ({:?}) with {} devices",
            reason,
            self.last_roster.len()
        );
        RosterUpdate {
            roster: self.last_roster.clone(),
            complete: true,
        }
    }

    fn build_roster(&self, names: &[String]) -> ScanRoster {
        let devices = names
            .iter()
            .enumerate()
            .map(|(index, name)| DeviceRecord {
                name: name.clone(),
                address: self
                    .known_addresses
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| format!("DEVICE_{}", index)),
                rssi: None,
            })
            .collect();
        ScanRoster { devices }
    }

    /// Names from lines already closed by a newline
    fn complete_names(buffer: &str) -> Vec<String> {
        match buffer.rfind('\n') {
            Some(end) => Self::all_names(&buffer[..end]),
            None => Vec::new(),
        }
    }

    fn all_names(buffer: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        buffer
            .split('\n')
            .map(|line| line.trim().trim_end_matches(SESSION_END).trim())
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_string()))
            .map(str::to_string)
            .collect()
    }
}
