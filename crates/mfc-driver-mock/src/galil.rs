//! Simulated Galil DMC motion controller.
//!
//! Replies follow the controller's framing: data lines end with `\r\n`,
//! accepted commands end with `:` and rejected ones with a bare `?`. The
//! reason for the last rejection is available through `TC1`.

use crate::serial::{LineDevice, SimulatedConnector};
use parking_lot::Mutex;
use std::sync::Arc;

/// `TC1` code for commands refused while an axis is moving.
pub const NOT_VALID_WHILE_RUNNING: u32 = 7;
/// `TC1` code for unknown commands.
pub const UNRECOGNIZED_COMMAND: u32 = 1;

#[derive(Debug, Default)]
struct GalilState {
    x: i64,
    y: i64,
    target: Option<Target>,
    speed_x: i64,
    speed_y: i64,
    echo: bool,
    limit_config: Option<String>,
    /// `MG _BGA, _BGB` queries that still report motion
    running_polls: u32,
    motion_polls: u32,
    last_error: u32,
    homing: bool,
    log: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Absolute(i64, i64),
    Relative(i64, i64),
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedGalil {
    state: Arc<Mutex<GalilState>>,
}

fn pair(args: &str) -> Option<(i64, i64)> {
    let (a, b) = args.split_once(',')?;
    let a: f64 = a.trim().parse().ok()?;
    let b: f64 = b.trim().parse().ok()?;
    Some((a.round() as i64, b.round() as i64))
}

impl SimulatedGalil {
    pub fn new() -> Self {
        let sim = Self::default();
        {
            let mut state = sim.state.lock();
            state.echo = true;
            state.motion_polls = 2;
            state.speed_x = 25_000;
            state.speed_y = 25_000;
        }
        sim
    }

    /// How many motion queries report "moving" after each `BG`.
    pub fn with_motion_polls(self, polls: u32) -> Self {
        self.state.lock().motion_polls = polls;
        self
    }

    /// Pretend a move is already running for `polls` motion queries.
    pub fn start_running(&self, polls: u32) {
        self.state.lock().running_polls = polls;
    }

    pub fn counts(&self) -> (i64, i64) {
        let state = self.state.lock();
        (state.x, state.y)
    }

    pub fn set_counts(&self, x: i64, y: i64) {
        let mut state = self.state.lock();
        state.x = x;
        state.y = y;
    }

    pub fn speed_counts(&self) -> (i64, i64) {
        let state = self.state.lock();
        (state.speed_x, state.speed_y)
    }

    pub fn echo_enabled(&self) -> bool {
        self.state.lock().echo
    }

    pub fn limit_config(&self) -> Option<String> {
        self.state.lock().limit_config.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Connector for a driver; commands end with `\r`.
    pub fn connector(&self) -> SimulatedConnector<Self> {
        SimulatedConnector::new(self.clone(), b'\r', "galil")
    }
}

fn ok() -> Vec<u8> {
    b":".to_vec()
}

fn data(line: String) -> Vec<u8> {
    format!("{line}\r\n:").into_bytes()
}

impl GalilState {
    fn reject(&mut self, code: u32) -> Vec<u8> {
        self.last_error = code;
        b"?".to_vec()
    }

    /// Refuse a command because an axis is moving. The move keeps
    /// progressing, so repeated attempts eventually get through.
    fn busy(&mut self) -> Vec<u8> {
        self.running_polls = self.running_polls.saturating_sub(1);
        self.reject(NOT_VALID_WHILE_RUNNING)
    }

    fn moving(&self) -> bool {
        self.running_polls > 0
    }

    fn begin(&mut self, axes: &str) -> Vec<u8> {
        if self.moving() {
            return self.busy();
        }
        let axes = axes.replace([',', ' '], "");
        if self.homing {
            if axes.contains('A') || axes.contains('X') {
                self.x = 0;
            }
            if axes.contains('B') || axes.contains('Y') {
                self.y = 0;
                self.homing = false;
            }
        } else if let Some(target) = self.target.take() {
            match target {
                Target::Absolute(x, y) => {
                    self.x = x;
                    self.y = y;
                }
                Target::Relative(dx, dy) => {
                    self.x += dx;
                    self.y += dy;
                }
            }
        }
        self.running_polls = self.motion_polls;
        ok()
    }
}

impl LineDevice for SimulatedGalil {
    fn respond(&self, command: &str) -> Vec<u8> {
        let mut state = self.state.lock();
        state.log.push(command.to_string());

        let (op, args) = command
            .split_once(' ')
            .map_or((command, ""), |(op, args)| (op, args.trim()));

        match op {
            "EO" => {
                state.echo = args != "0";
                ok()
            }
            "CN" => {
                state.limit_config = Some(args.replace(' ', ""));
                ok()
            }
            "TPA" => data(format!(" {}", state.x)),
            "TPB" => data(format!(" {}", state.y)),
            "TC1" => {
                let text = match state.last_error {
                    0 => "No error",
                    UNRECOGNIZED_COMMAND => "Unrecognized command",
                    NOT_VALID_WHILE_RUNNING => "Command not valid while running",
                    _ => "Unknown error",
                };
                data(format!(" {} {}", state.last_error, text))
            }
            "MG" if args.replace(' ', "") == "_BGA,_BGB" => {
                let flag = if state.moving() {
                    state.running_polls -= 1;
                    1
                } else {
                    0
                };
                data(format!(" {flag}.0000 {flag}.0000"))
            }
            "PA" | "PR" if !state.moving() => match pair(args) {
                Some((a, b)) if op == "PA" => {
                    state.target = Some(Target::Absolute(a, b));
                    ok()
                }
                Some((a, b)) => {
                    state.target = Some(Target::Relative(a, b));
                    ok()
                }
                None => state.reject(UNRECOGNIZED_COMMAND),
            },
            "PA" | "PR" => state.busy(),
            "BG" => state.begin(args),
            "BGA" => state.begin("A"),
            "BGB" => state.begin("B"),
            "HM" => {
                state.homing = true;
                ok()
            }
            "ST" => {
                state.running_polls = 0;
                state.target = None;
                ok()
            }
            "DP" => match pair(args) {
                Some((a, b)) => {
                    state.x = a;
                    state.y = b;
                    ok()
                }
                None => state.reject(UNRECOGNIZED_COMMAND),
            },
            "SP" if args.replace(' ', "") == "?,?" => {
                data(format!(" {}, {}", state.speed_x, state.speed_y))
            }
            "SP" => match pair(args) {
                Some((a, b)) => {
                    state.speed_x = a;
                    state.speed_y = b;
                    ok()
                }
                None => state.reject(UNRECOGNIZED_COMMAND),
            },
            _ => state.reject(UNRECOGNIZED_COMMAND),
        }
    }
}
