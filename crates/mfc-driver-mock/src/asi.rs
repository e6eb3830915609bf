//! Simulated ASI MS-2000 XY stage.
//!
//! Speaks the `2H`-addressed ASCII dialect: `STATUS` answers `B` while a
//! move is in progress and `N` otherwise, positions are reported in encoder
//! counts, speeds in mm/s.

use crate::serial::{LineDevice, SimulatedConnector};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct AsiState {
    x: f64,
    y: f64,
    speed_x: f64,
    speed_y: f64,
    /// STATUS queries that still answer busy
    busy_polls: u32,
    busy_after_move: u32,
    always_busy: bool,
    log: Vec<String>,
}

impl Default for AsiState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            speed_x: 5.745760,
            speed_y: 5.745760,
            busy_polls: 0,
            busy_after_move: 2,
            always_busy: false,
            log: Vec::new(),
        }
    }
}

/// Shared handle to a simulated stage. Clones see the same stage.
#[derive(Debug, Clone, Default)]
pub struct SimulatedAsiStage {
    state: Arc<Mutex<AsiState>>,
}

fn field(command: &str, key: &str) -> Option<f64> {
    command
        .split_whitespace()
        .find_map(|token| token.strip_prefix(key))
        .and_then(|value| value.parse().ok())
}

impl SimulatedAsiStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of busy STATUS replies after each move (default 2).
    pub fn with_busy_polls_after_move(self, polls: u32) -> Self {
        self.state.lock().busy_after_move = polls;
        self
    }

    /// Report busy forever, e.g. a jammed axis.
    pub fn set_always_busy(&self, busy: bool) {
        self.state.lock().always_busy = busy;
    }

    /// Position in encoder counts.
    pub fn counts(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.x, state.y)
    }

    pub fn set_counts(&self, x: f64, y: f64) {
        let mut state = self.state.lock();
        state.x = x;
        state.y = y;
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Connector for a driver; commands end with `\r`.
    pub fn connector(&self) -> SimulatedConnector<Self> {
        SimulatedConnector::new(self.clone(), b'\r', "asi")
    }
}

const ACK: &[u8] = b":A\r\n";

impl LineDevice for SimulatedAsiStage {
    fn respond(&self, command: &str) -> Vec<u8> {
        let mut state = self.state.lock();
        state.log.push(command.to_string());

        let Some(body) = command.strip_prefix("2H ") else {
            return b":N-1\r\n".to_vec();
        };

        match body {
            "STATUS" => {
                if state.always_busy || state.busy_polls > 0 {
                    state.busy_polls = state.busy_polls.saturating_sub(1);
                    b"B\r\n".to_vec()
                } else {
                    b"N\r\n".to_vec()
                }
            }
            "W X" => format!(":A {:.1}\r\n", state.x).into_bytes(),
            "W Y" => format!(":A {:.1}\r\n", state.y).into_bytes(),
            "S X?" => format!(":A X={:.6}\r\n", state.speed_x).into_bytes(),
            "S Y?" => format!(":A Y={:.6}\r\n", state.speed_y).into_bytes(),
            "HALT" => {
                state.busy_polls = 0;
                ACK.to_vec()
            }
            "HOME X Y" => {
                state.x = 0.0;
                state.y = 0.0;
                state.busy_polls = state.busy_after_move;
                ACK.to_vec()
            }
            "HERE X Y" => {
                state.x = 0.0;
                state.y = 0.0;
                ACK.to_vec()
            }
            _ if body.starts_with("MC ") => ACK.to_vec(),
            _ if body.starts_with("M ") => {
                if let Some(x) = field(body, "X=") {
                    state.x = x;
                }
                if let Some(y) = field(body, "Y=") {
                    state.y = y;
                }
                state.busy_polls = state.busy_after_move;
                ACK.to_vec()
            }
            _ if body.starts_with("R ") => {
                state.x += field(body, "X=").unwrap_or(0.0);
                state.y += field(body, "Y=").unwrap_or(0.0);
                state.busy_polls = state.busy_after_move;
                ACK.to_vec()
            }
            _ if body.starts_with("S ") => {
                if let Some(x) = field(body, "X=") {
                    state.speed_x = x;
                }
                if let Some(y) = field(body, "Y=") {
                    state.speed_y = y;
                }
                ACK.to_vec()
            }
            _ => b":N-1\r\n".to_vec(),
        }
    }
}
