// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The simulated chip: owns every peripheral instance, the signal lines, the
//! event queue, the register file and the pending interrupt set.
//!
//! Peripherals are stored in an arena and addressed by [`PeripheralId`]. While
//! one of them runs (a hook, a signal delivery or an event), it is taken out
//! of its slot so it can receive `&mut System`. A signal that arrives for a
//! peripheral that is currently running is queued and delivered right after
//! it returns, in the same cycle.

pub mod builder;

use crate::bus::{pack_fields, IoBus, ReadHook, RegBit, WriteHook};
use crate::config::SimulationConfig;
use crate::interrupt::{InterruptController, InterruptVector};
use crate::scheduler::{self, EventHandle, EventTarget, Scheduler};
use crate::signals::{LineFlags, LineId, LineSet, Signal, SignalBus, Subscriber, Target};
use crate::{Peripheral, SimResult, SimulationError};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{error, trace, warn};

/// Index of a peripheral instance inside its [`System`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeripheralId(pub(crate) usize);

impl PeripheralId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Slot {
    name: String,
    dev: Option<Box<dyn Peripheral>>,
    queued: VecDeque<(u32, Signal)>,
}

pub struct System {
    config: SimulationConfig,
    cycle: u64,
    signals: SignalBus,
    scheduler: Scheduler,
    io: IoBus,
    interrupts: InterruptController,
    slots: Vec<Slot>,
    fatal: Option<SimulationError>,
    depth: u32,
    reset_line: LineId,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("cycle", &self.cycle)
            .field("peripherals", &self.slots.len())
            .field("lines", &self.signals.len())
            .field("events", &self.scheduler.len())
            .field("fatal", &self.fatal)
            .finish()
    }
}

impl System {
    pub fn new(config: SimulationConfig, io_size: usize) -> Self {
        let mut signals = SignalBus::new();
        let reset_line = signals.allocate(None, &["reset"], LineFlags::BINARY).get(0);
        Self {
            config,
            cycle: 0,
            signals,
            scheduler: Scheduler::new(),
            io: IoBus::new(io_size),
            interrupts: InterruptController::new(),
            slots: Vec::new(),
            fatal: None,
            depth: 0,
            reset_line,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn frequency(&self) -> u64 {
        self.config.frequency_hz
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Moves the cycle counter forward. Only the executor calls this.
    pub fn advance(&mut self, cycles: u64) {
        self.cycle += cycles;
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    pub fn io(&self) -> &IoBus {
        &self.io
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptController {
        &mut self.interrupts
    }

    /// Line pulsed at the end of every system reset.
    pub fn reset_line(&self) -> LineId {
        self.reset_line
    }

    // ------------------------------------------------------------------
    // Peripheral arena
    // ------------------------------------------------------------------

    /// Registers a peripheral. `build` runs with the id the instance will get,
    /// so it can allocate lines and bind hooks before it is installed.
    pub fn attach<P, F>(&mut self, name: &str, build: F) -> PeripheralId
    where
        P: Peripheral + 'static,
        F: FnOnce(&mut System, PeripheralId) -> P,
    {
        let id = PeripheralId(self.slots.len());
        self.slots.push(Slot {
            name: name.to_string(),
            dev: None,
            queued: VecDeque::new(),
        });
        let dev = build(self, id);
        self.slots[id.0].dev = Some(Box::new(dev));
        self.drain(id);
        id
    }

    pub fn peripheral_count(&self) -> usize {
        self.slots.len()
    }

    pub fn peripheral_ids(&self) -> impl Iterator<Item = PeripheralId> {
        (0..self.slots.len()).map(PeripheralId)
    }

    pub fn peripheral_name(&self, id: PeripheralId) -> &str {
        self.slots.get(id.0).map(|s| s.name.as_str()).unwrap_or("")
    }

    pub fn find_peripheral(&self, name: &str) -> Option<PeripheralId> {
        self.slots
            .iter()
            .position(|s| s.name == name)
            .map(PeripheralId)
    }

    /// Typed access to an installed peripheral.
    pub fn get<T: 'static>(&self, id: PeripheralId) -> Option<&T> {
        self.slots
            .get(id.0)?
            .dev
            .as_ref()?
            .as_any()?
            .downcast_ref::<T>()
    }

    pub fn get_mut<T: 'static>(&mut self, id: PeripheralId) -> Option<&mut T> {
        self.slots
            .get_mut(id.0)?
            .dev
            .as_mut()?
            .as_any_mut()?
            .downcast_mut::<T>()
    }

    pub fn snapshot(&self, id: PeripheralId) -> serde_json::Value {
        self.slots
            .get(id.0)
            .and_then(|s| s.dev.as_ref())
            .map(|d| d.snapshot())
            .unwrap_or(serde_json::Value::Null)
    }

    /// Runs `f` with the peripheral taken out of its slot. Returns `None` if
    /// the id is unknown or the peripheral is already running further up the
    /// stack.
    pub fn with_peripheral<R>(
        &mut self,
        id: PeripheralId,
        f: impl FnOnce(&mut dyn Peripheral, &mut System) -> R,
    ) -> Option<R> {
        let mut dev = self.slots.get_mut(id.0)?.dev.take()?;
        let result = f(dev.as_mut(), self);
        self.slots[id.0].dev = Some(dev);
        self.drain(id);
        Some(result)
    }

    fn drain(&mut self, id: PeripheralId) {
        while let Some((input, signal)) = self
            .slots
            .get_mut(id.0)
            .and_then(|slot| slot.queued.pop_front())
        {
            self.deliver(id, input, signal);
        }
    }

    fn deliver(&mut self, id: PeripheralId, input: u32, signal: Signal) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return;
        };
        if slot.dev.is_none() {
            trace!(peripheral = %slot.name, input, "queued reentrant delivery");
            slot.queued.push_back((input, signal));
            return;
        }
        if !self.enter(signal.line) {
            return;
        }
        self.with_peripheral(id, |dev, sys| dev.on_signal(sys, input, signal));
        self.depth -= 1;
    }

    // ------------------------------------------------------------------
    // Signal bus
    // ------------------------------------------------------------------

    pub fn alloc_lines(
        &mut self,
        owner: Option<PeripheralId>,
        names: &[&str],
        flags: LineFlags,
    ) -> LineSet {
        self.signals.allocate(owner, names, flags)
    }

    /// Subscribes peripheral `id` to `line`; raises are delivered to
    /// `Peripheral::on_signal` with `input`.
    pub fn subscribe(&mut self, line: LineId, id: PeripheralId, input: u32) {
        self.signals
            .subscribe(line, Subscriber::Peripheral { id, input });
    }

    /// Wires `output` to `input`: every raise of `output` is forwarded.
    /// Fan-out is additive, repeating an existing pair does nothing.
    pub fn connect(&mut self, output: LineId, input: LineId) {
        self.signals.subscribe(output, Subscriber::Line(input));
    }

    pub fn disconnect(&mut self, output: LineId, input: LineId) {
        self.signals.unsubscribe(output, &Subscriber::Line(input));
    }

    /// Low-level observer, called after every raise of `line`.
    pub fn register_notify<F>(&mut self, line: LineId, f: F)
    where
        F: FnMut(&mut System, Signal) + Send + 'static,
    {
        self.signals.add_notify(line, Box::new(f));
    }

    pub fn line_value(&self, line: LineId) -> u32 {
        self.signals.value(line)
    }

    /// Sets `line` to `value` and runs every subscriber, in registration
    /// order, before returning.
    pub fn raise(&mut self, line: LineId, value: u32) {
        let entry = self.signals.line(line);
        if self.fatal.is_some() {
            return;
        }
        let value = if entry.flags.contains(LineFlags::BINARY) {
            u32::from(value != 0)
        } else {
            value
        };
        let previous = entry.value;
        if entry.flags.contains(LineFlags::FILTERED) && previous == value {
            return;
        }
        if !self.enter(line) {
            return;
        }

        self.signals.line_mut(line).value = value;
        let signal = Signal {
            line,
            value,
            previous,
        };
        // wiring added by a subscriber applies from the next raise on
        for target in self.signals.targets(line) {
            if self.fatal.is_some() {
                break;
            }
            match target {
                Target::Line(next) => self.raise(next, value),
                Target::Peripheral { id, input } => self.deliver(id, input, signal),
                Target::Notify(key) => {
                    // a closure already running further up the stack is skipped
                    let Some(mut f) = self.signals.take_notify(line, key) else {
                        continue;
                    };
                    f(self, signal);
                    self.signals.restore_notify(line, key, f);
                }
            }
        }
        self.depth -= 1;
    }

    fn enter(&mut self, line: LineId) -> bool {
        if self.fatal.is_some() {
            return false;
        }
        if self.depth >= self.config.max_propagation_depth {
            let name = self.signals.name(line).to_string();
            error!(line = %name, depth = self.depth, "signal propagation exceeded depth limit");
            self.set_fatal(SimulationError::PropagationDepthExceeded {
                line: name,
                depth: self.depth,
            });
            return false;
        }
        self.depth += 1;
        true
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    pub fn schedule(&mut self, delay: u64, id: PeripheralId, token: u32) -> EventHandle {
        self.scheduler
            .insert(self.cycle + delay, EventTarget::Peripheral { id, token })
    }

    pub fn schedule_fn<F>(&mut self, delay: u64, f: F) -> EventHandle
    where
        F: FnMut(&mut System, u64) -> Option<u64> + Send + 'static,
    {
        self.scheduler
            .insert(self.cycle + delay, EventTarget::Closure(Box::new(f)))
    }

    pub fn schedule_at_usec(&mut self, usec: u64, id: PeripheralId, token: u32) -> EventHandle {
        let delay = self.usec_to_cycles(usec);
        self.schedule(delay, id, token)
    }

    pub fn schedule_fn_at_usec<F>(&mut self, usec: u64, f: F) -> EventHandle
    where
        F: FnMut(&mut System, u64) -> Option<u64> + Send + 'static,
    {
        let delay = self.usec_to_cycles(usec);
        self.schedule_fn(delay, f)
    }

    /// Removes the pending event(s) of `(id, token)`; no-op when none exist.
    pub fn cancel(&mut self, id: PeripheralId, token: u32) -> usize {
        self.scheduler.cancel(id, token)
    }

    pub fn cancel_handle(&mut self, handle: EventHandle) -> bool {
        self.scheduler.cancel_handle(handle)
    }

    pub fn is_scheduled(&self, id: PeripheralId, token: u32) -> bool {
        self.scheduler.is_pending(id, token)
    }

    pub fn usec_to_cycles(&self, usec: u64) -> u64 {
        scheduler::usec_to_cycles(self.config.frequency_hz, usec)
    }

    pub fn cycles_to_usec(&self, cycles: u64) -> u64 {
        scheduler::cycles_to_usec(self.config.frequency_hz, cycles)
    }

    /// Fires every event due at the current cycle, earliest first. Events
    /// created while this runs wait for the next call. Returns the number of
    /// events fired.
    pub fn service(&mut self) -> usize {
        let watermark = self.scheduler.watermark();
        let mut fired = 0;
        while self.fatal.is_none() {
            let Some((when, target)) = self.scheduler.pop_due(self.cycle, watermark) else {
                break;
            };
            fired += 1;
            match target {
                EventTarget::Peripheral { id, token } => {
                    let next = self.with_peripheral(id, |dev, sys| dev.on_event(sys, token, when));
                    match next {
                        None => warn!(
                            peripheral = %self.peripheral_name(id),
                            token,
                            "event dropped, peripheral busy or missing"
                        ),
                        Some(Some(delay)) if delay > 0 => {
                            self.scheduler
                                .insert(when + delay, EventTarget::Peripheral { id, token });
                        }
                        Some(_) => {}
                    }
                }
                EventTarget::Closure(mut f) => {
                    if let Some(delay) = f(self, when).filter(|d| *d > 0) {
                        self.scheduler.insert(when + delay, EventTarget::Closure(f));
                    }
                }
            }
        }
        fired
    }

    // ------------------------------------------------------------------
    // Register interception
    // ------------------------------------------------------------------

    pub fn bind_read(&mut self, addr: u16, id: PeripheralId, token: u32) {
        self.io.bind_read(addr, ReadHook::Peripheral { id, token });
    }

    pub fn bind_write(&mut self, addr: u16, id: PeripheralId, token: u32) {
        self.io.bind_write(addr, WriteHook::Peripheral { id, token });
    }

    pub fn bind_read_fn<F>(&mut self, addr: u16, f: F)
    where
        F: FnMut(&mut System, u16) -> u8 + Send + 'static,
    {
        self.io.bind_read(addr, ReadHook::Closure(Box::new(f)));
    }

    pub fn bind_write_fn<F>(&mut self, addr: u16, f: F)
    where
        F: FnMut(&mut System, u16, u8) + Send + 'static,
    {
        self.io.bind_write(addr, WriteHook::Closure(Box::new(f)));
    }

    pub fn default_read(&self, addr: u16) -> u8 {
        self.io.default_read(addr)
    }

    pub fn default_write(&mut self, addr: u16, value: u8) {
        self.io.default_write(addr, value);
    }

    /// CPU-visible read: runs the read hook if one is bound. Default storage
    /// belongs to the hook; the returned value is not stored.
    pub fn read(&mut self, addr: u16) -> u8 {
        if let Some((id, token)) = self.io.peripheral_read_hook(addr) {
            if let Some(v) = self.with_peripheral(id, |dev, sys| dev.io_read(sys, addr, token)) {
                return v;
            }
        } else if let Some(mut f) = self.io.take_read_closure(addr) {
            let v = f(self, addr);
            self.io.restore_read_closure(addr, f);
            return v;
        }
        self.io.default_read(addr)
    }

    /// CPU-visible write: the hook, if any, decides what gets stored.
    pub fn write(&mut self, addr: u16, value: u8) {
        if let Some((id, token)) = self.io.peripheral_write_hook(addr) {
            if self
                .with_peripheral(id, |dev, sys| dev.io_write(sys, addr, value, token))
                .is_some()
            {
                return;
            }
        } else if let Some(mut f) = self.io.take_write_closure(addr) {
            f(self, addr, value);
            self.io.restore_write_closure(addr, f);
            return;
        }
        self.io.default_write(addr, value);
    }

    pub fn read_u16(&mut self, lo: u16) -> u16 {
        let l = self.read(lo) as u16;
        let h = self.read(lo + 1) as u16;
        l | (h << 8)
    }

    pub fn regbit_get(&self, rb: RegBit) -> u8 {
        if rb.is_none() {
            return 0;
        }
        rb.from_value(self.io.default_read(rb.reg))
    }

    pub fn regbit_set(&mut self, rb: RegBit) -> u8 {
        self.regbit_setto(rb, rb.mask)
    }

    pub fn regbit_clear(&mut self, rb: RegBit) {
        self.regbit_setto(rb, 0);
    }

    pub fn regbit_setto(&mut self, rb: RegBit, v: u8) -> u8 {
        if rb.is_none() {
            return 0;
        }
        let current = self.io.default_read(rb.reg);
        self.io.default_write(rb.reg, rb.insert(current, v));
        self.regbit_get(rb)
    }

    pub fn regbit_get_array(&self, fields: &[RegBit]) -> u8 {
        pack_fields(fields, |addr| self.io.default_read(addr))
    }

    // ------------------------------------------------------------------
    // Interrupts
    // ------------------------------------------------------------------

    pub fn register_vector(&mut self, vector: InterruptVector) {
        self.interrupts.register(vector);
    }

    /// Sets the vector's raised flag and, when its enable bit allows it,
    /// marks it pending. Returns true if it is now pending.
    pub fn raise_interrupt(&mut self, vector: &InterruptVector) -> bool {
        if vector.vector == 0 {
            return false;
        }
        if !vector.raised.is_none() {
            self.regbit_set(vector.raised);
        }
        if vector.enable.is_none() || self.regbit_get(vector.enable) != 0 {
            self.interrupts.set_pending(vector.vector);
            return true;
        }
        false
    }

    pub fn clear_interrupt(&mut self, vector: &InterruptVector) {
        if !vector.raised.is_none() {
            self.regbit_clear(vector.raised);
        }
        self.interrupts.clear(vector.vector);
    }

    /// Write-one-to-clear handling for a raised flag: clears the flag and the
    /// pending state when `written` has the flag bit set.
    pub fn clear_interrupt_if(&mut self, vector: &InterruptVector, written: u8) -> bool {
        if vector.raised.is_none() || vector.raised.from_value(written) == 0 {
            return false;
        }
        self.clear_interrupt(vector);
        true
    }

    /// Called by the executor when it enters a vector: pops the highest
    /// priority pending vector and clears its raised flag.
    pub fn acknowledge_interrupt(&mut self) -> Option<u8> {
        let number = self.interrupts.next_pending()?;
        self.interrupts.clear(number);
        if let Some(vector) = self.interrupts.vector(number).copied() {
            if !vector.raised.is_none() {
                self.regbit_clear(vector.raised);
            }
        }
        Some(number)
    }

    // ------------------------------------------------------------------
    // Faults and reset
    // ------------------------------------------------------------------

    /// Latches a fatal diagnostic from `source`. The first one wins; from then
    /// on raises and event servicing stop and the executor reports the error.
    pub fn fatal(&mut self, source: &str, message: impl Into<String>) {
        let message = message.into();
        error!(peripheral = %source, "{}", message);
        self.set_fatal(SimulationError::Fatal {
            peripheral: source.to_string(),
            message,
        });
    }

    fn set_fatal(&mut self, err: SimulationError) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    pub fn fatal_error(&self) -> Option<&SimulationError> {
        self.fatal.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn check(&self) -> SimResult<()> {
        match &self.fatal {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Queues a system reset. It is delivered as a zero-delay event: every
    /// peripheral's `reset` runs in attach order, then the reset line pulses.
    pub fn reset(&mut self) {
        self.interrupts.reset();
        self.schedule_fn(0, |sys, _| {
            let ids: Vec<PeripheralId> = sys.peripheral_ids().collect();
            for id in ids {
                sys.with_peripheral(id, |dev, sys| dev.reset(sys));
            }
            let line = sys.reset_line;
            sys.raise(line, 1);
            sys.raise(line, 0);
            None
        });
    }
}
