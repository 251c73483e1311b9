// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Signal lines ("IRQs") connecting peripheral models.
//!
//! A line is a named, directed, value-carrying connection point. Lines live in
//! an arena owned by the [`System`](crate::System); peripherals refer to them
//! through [`LineId`] indices, and subscriber lists hold indices as well, so two
//! peripherals wired to each other never own one another.
//!
//! Dispatch (running the subscribers) is done by `System::raise`, which needs
//! mutable access to the whole system. This module only keeps the wiring.

use crate::system::PeripheralId;
use crate::System;

/// Opaque handle to one allocated signal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub(crate) usize);

impl LineId {
    pub fn index(self) -> usize {
        self.0
    }
}

bitflags::bitflags! {
    /// Per-line behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineFlags: u8 {
        /// Raising the line with its current value is a no-op.
        const FILTERED = 1 << 0;
        /// The value is a single logic level rather than a data word.
        const BINARY = 1 << 1;
    }
}

/// What a subscriber sees when a line is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub line: LineId,
    pub value: u32,
    /// Value of the line before this raise, for edge detection.
    pub previous: u32,
}

impl Signal {
    pub fn is_falling_edge(&self) -> bool {
        self.previous != 0 && self.value == 0
    }

    pub fn is_rising_edge(&self) -> bool {
        self.previous == 0 && self.value != 0
    }
}

/// Closure subscriber installed with `System::register_notify`.
pub type NotifyFn = Box<dyn FnMut(&mut System, Signal) + Send>;

/// One entry in a line's subscriber list.
pub enum Subscriber {
    /// Forward the value to another line (`connect`).
    Line(LineId),
    /// Deliver to a peripheral's numbered input.
    Peripheral { id: PeripheralId, input: u32 },
    /// Arbitrary observer. `f` is `None` while the closure is running.
    Notify { key: u64, f: Option<NotifyFn> },
}

/// Copy of one subscriber's wiring, taken before a raise dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Line(LineId),
    Peripheral { id: PeripheralId, input: u32 },
    Notify(u64),
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subscriber::Line(line) => f.debug_tuple("Line").field(line).finish(),
            Subscriber::Peripheral { id, input } => f
                .debug_struct("Peripheral")
                .field("id", id)
                .field("input", input)
                .finish(),
            Subscriber::Notify { key, .. } => f.debug_tuple("Notify").field(key).finish(),
        }
    }
}

impl Subscriber {
    fn same_target(&self, other: &Subscriber) -> bool {
        match (self, other) {
            (Subscriber::Line(a), Subscriber::Line(b)) => a == b,
            (
                Subscriber::Peripheral { id: a, input: ia },
                Subscriber::Peripheral { id: b, input: ib },
            ) => a == b && ia == ib,
            _ => false,
        }
    }

    fn target(&self) -> Target {
        match self {
            Subscriber::Line(line) => Target::Line(*line),
            Subscriber::Peripheral { id, input } => Target::Peripheral {
                id: *id,
                input: *input,
            },
            Subscriber::Notify { key, .. } => Target::Notify(*key),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Line {
    pub name: String,
    pub owner: Option<PeripheralId>,
    pub flags: LineFlags,
    pub value: u32,
    pub subscribers: Vec<Subscriber>,
}

/// A contiguous block of lines belonging to one peripheral instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSet {
    base: usize,
    count: usize,
}

impl LineSet {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Line at local index `index`. Panics when out of range: line sets are
    /// fixed at construction time.
    pub fn get(&self, index: usize) -> LineId {
        assert!(
            index < self.count,
            "line index {} out of range for a set of {}",
            index,
            self.count
        );
        LineId(self.base + index)
    }

    pub fn iter(&self) -> impl Iterator<Item = LineId> {
        let base = self.base;
        (0..self.count).map(move |i| LineId(base + i))
    }
}

/// Arena of every line in the system.
#[derive(Debug, Default)]
pub struct SignalBus {
    pub(crate) lines: Vec<Line>,
    next_notify: u64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `names.len()` lines for `owner`, all with the same `flags`.
    pub fn allocate(
        &mut self,
        owner: Option<PeripheralId>,
        names: &[&str],
        flags: LineFlags,
    ) -> LineSet {
        let base = self.lines.len();
        for name in names {
            self.lines.push(Line {
                name: (*name).to_string(),
                owner,
                flags,
                value: 0,
                subscribers: Vec::new(),
            });
        }
        LineSet {
            base,
            count: names.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub(crate) fn line(&self, id: LineId) -> &Line {
        assert!(
            id.0 < self.lines.len(),
            "signal line {} was never allocated",
            id.0
        );
        &self.lines[id.0]
    }

    pub(crate) fn line_mut(&mut self, id: LineId) -> &mut Line {
        assert!(
            id.0 < self.lines.len(),
            "signal line {} was never allocated",
            id.0
        );
        &mut self.lines[id.0]
    }

    pub fn value(&self, id: LineId) -> u32 {
        self.line(id).value
    }

    pub fn name(&self, id: LineId) -> &str {
        &self.line(id).name
    }

    pub fn owner(&self, id: LineId) -> Option<PeripheralId> {
        self.line(id).owner
    }

    pub fn flags(&self, id: LineId) -> LineFlags {
        self.line(id).flags
    }

    pub fn set_flags(&mut self, id: LineId, flags: LineFlags) {
        self.line_mut(id).flags = flags;
    }

    /// Appends `subscriber` to `line` unless an identical wiring is already
    /// present. Returns false for the duplicate case.
    pub fn subscribe(&mut self, line: LineId, subscriber: Subscriber) -> bool {
        if let Subscriber::Line(target) = &subscriber {
            // validate both ends up front
            self.line(*target);
        }
        let entry = self.line_mut(line);
        if entry
            .subscribers
            .iter()
            .any(|existing| existing.same_target(&subscriber))
        {
            return false;
        }
        entry.subscribers.push(subscriber);
        true
    }

    /// Appends a closure observer to `line`.
    pub fn add_notify(&mut self, line: LineId, f: NotifyFn) {
        let key = self.next_notify;
        self.next_notify += 1;
        self.line_mut(line)
            .subscribers
            .push(Subscriber::Notify { key, f: Some(f) });
    }

    /// Subscriber wiring of `line` in registration order.
    pub(crate) fn targets(&self, line: LineId) -> Vec<Target> {
        self.line(line)
            .subscribers
            .iter()
            .map(Subscriber::target)
            .collect()
    }

    /// Takes the closure `key` out of `line` for the duration of a call.
    /// `None` when it is already running.
    pub(crate) fn take_notify(&mut self, line: LineId, key: u64) -> Option<NotifyFn> {
        self.line_mut(line)
            .subscribers
            .iter_mut()
            .find_map(|sub| match sub {
                Subscriber::Notify { key: k, f } if *k == key => f.take(),
                _ => None,
            })
    }

    pub(crate) fn restore_notify(&mut self, line: LineId, key: u64, f: NotifyFn) {
        let slot = self
            .line_mut(line)
            .subscribers
            .iter_mut()
            .find_map(|sub| match sub {
                Subscriber::Notify { key: k, f } if *k == key => Some(f),
                _ => None,
            });
        if let Some(slot) = slot {
            *slot = Some(f);
        }
    }

    /// Removes line-to-line and peripheral wirings matching `subscriber`.
    pub fn unsubscribe(&mut self, line: LineId, subscriber: &Subscriber) {
        self.line_mut(line)
            .subscribers
            .retain(|existing| !existing.same_target(subscriber));
    }

    pub fn subscriber_count(&self, line: LineId) -> usize {
        self.line(line).subscribers.len()
    }

    /// Finds a line by its owner and name.
    pub fn find(&self, owner: PeripheralId, name: &str) -> Option<LineId> {
        self.lines
            .iter()
            .position(|l| l.owner == Some(owner) && l.name == name)
            .map(LineId)
    }
}
