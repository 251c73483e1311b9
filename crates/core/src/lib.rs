// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bus;
pub mod chips;
pub mod config;
pub mod interrupt;
pub mod parts;
pub mod peripherals;
pub mod scheduler;
pub mod signals;
pub mod system;
pub mod usb;

pub use config::SimulationConfig;
pub use signals::{LineFlags, LineId, LineSet, Signal};
pub use system::builder as board;
pub use system::{PeripheralId, System};

use std::any::Any;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulationError {
    #[error("{peripheral}: {message}")]
    Fatal { peripheral: String, message: String },
    #[error("signal propagation exceeded depth {depth} while raising {line}")]
    PropagationDepthExceeded { line: String, depth: u32 },
    #[error("I/O address {0:#06x} is outside the register file")]
    InvalidAddress(u16),
    #[error("unknown peripheral '{0}'")]
    UnknownPeripheral(String),
    #[error("peripheral '{peripheral}' has no line named '{line}'")]
    UnknownLine { peripheral: String, line: String },
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Behaviour of a peripheral instance living inside a [`System`].
///
/// Every entry point receives the system so the model can touch registers,
/// raise lines and schedule events. The `input`/`token` arguments are the
/// values the peripheral chose when it subscribed, scheduled or bound a hook.
pub trait Peripheral: std::fmt::Debug + Send {
    /// Power-on defaults; called for every peripheral on a system reset.
    fn reset(&mut self, _sys: &mut System) {}

    fn on_signal(&mut self, _sys: &mut System, _input: u32, _signal: Signal) {}

    /// Scheduled event fired at cycle `when`. The return value re-arms the
    /// event relative to `when`; `None` or `Some(0)` stops it.
    fn on_event(&mut self, _sys: &mut System, _token: u32, _when: u64) -> Option<u64> {
        None
    }

    fn io_read(&mut self, sys: &mut System, addr: u16, _token: u32) -> u8 {
        sys.default_read(addr)
    }

    fn io_write(&mut self, sys: &mut System, addr: u16, value: u8, _token: u32) {
        sys.default_write(addr, value);
    }

    fn as_any(&self) -> Option<&dyn Any> {
        None
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// The instruction executor driving a [`System`].
pub trait Cpu: Send {
    fn reset(&mut self, sys: &mut System) -> SimResult<()>;
    /// Executes one instruction and returns the cycles it took.
    fn step(&mut self, sys: &mut System) -> SimResult<u32>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    StepDone,
    MaxStepsReached,
}

pub struct Machine<C: Cpu> {
    pub cpu: C,
    pub system: System,
    pub total_steps: u64,
}

impl<C: Cpu> Machine<C> {
    pub fn new(cpu: C, system: System) -> Self {
        Self {
            cpu,
            system,
            total_steps: 0,
        }
    }

    pub fn reset(&mut self) -> SimResult<()> {
        self.system.reset();
        self.system.service();
        self.cpu.reset(&mut self.system)?;
        self.system.check()
    }

    /// One instruction, then every event due at the new cycle.
    pub fn step(&mut self) -> SimResult<StopReason> {
        self.system.check()?;
        let cycles = self.cpu.step(&mut self.system)?;
        self.system.advance(cycles as u64);
        self.system.service();
        self.total_steps += 1;
        self.system.check()?;
        Ok(StopReason::StepDone)
    }

    pub fn run(&mut self, max_steps: Option<u64>) -> SimResult<StopReason> {
        let mut steps = 0;
        loop {
            self.step()?;
            steps += 1;
            if let Some(max) = max_steps {
                if steps >= max {
                    return Ok(StopReason::MaxStepsReached);
                }
            }
        }
    }

    pub fn cycle(&self) -> u64 {
        self.system.cycle()
    }

    pub fn peek_peripheral(&self, name: &str) -> Option<serde_json::Value> {
        self.system
            .find_peripheral(name)
            .map(|id| self.system.snapshot(id))
    }
}
