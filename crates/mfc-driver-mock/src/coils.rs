//! Simulated Modbus coil bank (WAGO 750 style).
//!
//! Output coils are written at `write_offset + index` and read back through
//! the process image at `read_offset + index`, like the WAGO couplers do.

use async_trait::async_trait;
use mfc_core::transport::{CoilBus, CoilConnector, DynCoilBus};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

#[derive(Debug, Default)]
struct BankState {
    outputs: Vec<bool>,
    read_offset: u16,
    write_offset: u16,
    /// Outputs that ignore writes and hold a fixed value
    stuck: HashMap<usize, bool>,
    /// Write addresses that fail with a transport error
    failing_writes: HashSet<u16>,
    fail_reads: bool,
    refuse: bool,
    connects: u32,
    disconnects: u32,
}

impl BankState {
    fn index(&self, address: u16, offset: u16) -> io::Result<usize> {
        address
            .checked_sub(offset)
            .map(usize::from)
            .filter(|i| *i < self.outputs.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("illegal data address {address}"),
                )
            })
    }
}

/// Shared simulated coil bank. Clones see the same outputs.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCoilBank {
    state: Arc<Mutex<BankState>>,
}

impl SimulatedCoilBank {
    /// Bank with `outputs` coils, all off, read and written at offset 0.
    pub fn new(outputs: u16) -> Self {
        let bank = Self::default();
        bank.state.lock().outputs = vec![false; usize::from(outputs)];
        bank
    }

    pub fn with_read_offset(self, offset: u16) -> Self {
        self.state.lock().read_offset = offset;
        self
    }

    pub fn with_write_offset(self, offset: u16) -> Self {
        self.state.lock().write_offset = offset;
        self
    }

    pub fn outputs(&self) -> Vec<bool> {
        let state = self.state.lock();
        state
            .outputs
            .iter()
            .enumerate()
            .map(|(i, v)| state.stuck.get(&i).copied().unwrap_or(*v))
            .collect()
    }

    pub fn set_output(&self, index: usize, value: bool) {
        if let Some(slot) = self.state.lock().outputs.get_mut(index) {
            *slot = value;
        }
    }

    /// Hold output `index` at `value` regardless of writes.
    pub fn stick(&self, index: usize, value: bool) {
        self.state.lock().stuck.insert(index, value);
    }

    /// Make writes to coil `address` fail.
    pub fn fail_writes_at(&self, address: u16) {
        self.state.lock().failing_writes.insert(address);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// (connects, disconnects) seen so far.
    pub fn sessions(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.connects, state.disconnects)
    }

    pub fn connector(&self) -> SimulatedCoilConnector {
        SimulatedCoilConnector { bank: self.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedCoilConnector {
    bank: SimulatedCoilBank,
}

#[async_trait]
impl CoilConnector for SimulatedCoilConnector {
    async fn open(&self) -> io::Result<DynCoilBus> {
        let mut state = self.bank.state.lock();
        if state.refuse {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        state.connects += 1;
        Ok(Box::new(SimulatedCoilSession {
            bank: self.bank.clone(),
            open: true,
        }))
    }

    fn describe(&self) -> String {
        "sim://coils".to_string()
    }
}

struct SimulatedCoilSession {
    bank: SimulatedCoilBank,
    open: bool,
}

impl SimulatedCoilSession {
    fn check_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "session closed"))
        }
    }
}

#[async_trait]
impl CoilBus for SimulatedCoilSession {
    async fn read_coils(&mut self, address: u16, count: u16) -> io::Result<Vec<bool>> {
        self.check_open()?;
        let state = self.bank.state.lock();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        (0..count)
            .map(|i| -> io::Result<bool> {
                let index = state.index(address.saturating_add(i), state.read_offset)?;
                Ok(state
                    .stuck
                    .get(&index)
                    .copied()
                    .unwrap_or(state.outputs[index]))
            })
            .collect()
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> io::Result<()> {
        self.check_open()?;
        let mut state = self.bank.state.lock();
        if state.failing_writes.contains(&address) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        let index = state.index(address, state.write_offset)?;
        state.outputs[index] = value;
        Ok(())
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        if self.open {
            self.open = false;
            self.bank.state.lock().disconnects += 1;
        }
        Ok(())
    }
}
