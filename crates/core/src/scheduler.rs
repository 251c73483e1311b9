// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Cycle-indexed event queue.
//!
//! Events are ordered by `(fire cycle, insertion sequence)`, so two events due
//! on the same cycle fire in the order they were scheduled. The queue itself
//! never deduplicates: a peripheral that wants at most one pending event per
//! token cancels before re-arming.

use crate::system::PeripheralId;
use crate::System;
use std::collections::BTreeMap;

/// Closure callback. Receives the cycle the event was due at and returns the
/// delay to the next occurrence, `None` or `Some(0)` to stop.
pub type EventFn = Box<dyn FnMut(&mut System, u64) -> Option<u64> + Send>;

/// Who gets called when an event fires.
pub enum EventTarget {
    Peripheral { id: PeripheralId, token: u32 },
    Closure(EventFn),
}

impl std::fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventTarget::Peripheral { id, token } => f
                .debug_struct("Peripheral")
                .field("id", id)
                .field("token", token)
                .finish(),
            EventTarget::Closure(_) => f.write_str("Closure(..)"),
        }
    }
}

impl EventTarget {
    fn matches(&self, id: PeripheralId, token: u32) -> bool {
        matches!(self, EventTarget::Peripheral { id: i, token: t } if *i == id && *t == token)
    }
}

/// Handle returned by `schedule`, usable with `cancel_handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    when: u64,
    seq: u64,
}

impl EventHandle {
    pub fn fire_cycle(&self) -> u64 {
        self.when
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    events: BTreeMap<(u64, u64), EventTarget>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, when: u64, target: EventTarget) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.insert((when, seq), target);
        EventHandle { when, seq }
    }

    /// Removes every pending event for `(id, token)`. Returns how many were
    /// removed.
    pub fn cancel(&mut self, id: PeripheralId, token: u32) -> usize {
        let before = self.events.len();
        self.events.retain(|_, target| !target.matches(id, token));
        before - self.events.len()
    }

    pub fn cancel_handle(&mut self, handle: EventHandle) -> bool {
        self.events.remove(&(handle.when, handle.seq)).is_some()
    }

    /// Drops every event owned by `id`.
    pub fn cancel_all(&mut self, id: PeripheralId) {
        self.events.retain(
            |_, target| !matches!(target, EventTarget::Peripheral { id: i, .. } if *i == id),
        );
    }

    pub fn is_pending(&self, id: PeripheralId, token: u32) -> bool {
        self.events.values().any(|t| t.matches(id, token))
    }

    /// Fire cycle of the first pending `(id, token)` event.
    pub fn pending_at(&self, id: PeripheralId, token: u32) -> Option<u64> {
        self.events
            .iter()
            .find(|(_, t)| t.matches(id, token))
            .map(|((when, _), _)| *when)
    }

    /// Sequence number the next inserted event will get. `service` uses it as
    /// a boundary so events created while servicing wait for the next pass.
    pub fn watermark(&self) -> u64 {
        self.next_seq
    }

    /// Removes and returns the earliest event due at or before `now` that was
    /// inserted before `watermark`.
    pub fn pop_due(&mut self, now: u64, watermark: u64) -> Option<(u64, EventTarget)> {
        let key = self
            .events
            .keys()
            .take_while(|(when, _)| *when <= now)
            .find(|(_, seq)| *seq < watermark)
            .copied()?;
        self.events.remove(&key).map(|target| (key.0, target))
    }

    /// Cycle of the earliest pending event.
    pub fn next_due(&self) -> Option<u64> {
        self.events.keys().next().map(|(when, _)| *when)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Converts microseconds to cycles at `frequency` Hz, truncating.
pub fn usec_to_cycles(frequency: u64, usec: u64) -> u64 {
    ((frequency as u128 * usec as u128) / 1_000_000) as u64
}

/// Converts cycles to microseconds at `frequency` Hz, truncating.
pub fn cycles_to_usec(frequency: u64, cycles: u64) -> u64 {
    if frequency == 0 {
        return 0;
    }
    ((cycles as u128 * 1_000_000) / frequency as u128) as u64
}
