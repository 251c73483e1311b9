// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! SSD1306 / SH1106 OLED controllers.
//!
//! Both chips share one model. What differs between them (geometry, command
//! set, power-on state, bus address) lives in a [`DisplayVariant`] table.
//!
//! The controller listens either to an SPI byte stream, with `cs` (active
//! low), `dc` and `reset` pins, or to TWI messages, where a control byte after
//! the address selects command or data mode for the bytes that follow.

use crate::peripherals::{TwiCond, TwiMessage};
use crate::signals::{LineFlags, LineId, LineSet, Signal};
use crate::{Peripheral, PeripheralId, System};
use serde::Serialize;
use std::any::Any;
use tracing::{debug, trace, warn};

/// Largest column count of any variant.
pub const MAX_COLUMNS: usize = 132;
pub const MAX_PAGES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressingMode {
    Horizontal,
    Vertical,
    Page,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DisplayFlags: u8 {
        const INVERTED = 1 << 0;
        const DISPLAY_ON = 1 << 1;
        /// Column 0 maps to SEG0.
        const SEGMENT_REMAP_0 = 1 << 2;
        const COM_SCAN_NORMAL = 1 << 3;
        const ENTIRE_ON = 1 << 4;
        const SCROLLING = 1 << 5;
        const CHARGE_PUMP = 1 << 6;
    }
}

/// What a command does once all its parameter bytes are in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOp {
    ColumnLow,
    ColumnHigh,
    Page,
    StartLine,
    Contrast,
    ChargePump,
    MemoryMode,
    ColumnWindow,
    PageWindow,
    HorizontalScroll,
    DiagonalScroll,
    VerticalScrollArea,
    ScrollOff,
    ScrollOn,
    SegmentRemap,
    ComScan,
    EntireOn,
    Invert,
    Power,
    /// Timing or panel configuration with no visible effect.
    Setting,
    Nop,
}

/// One row of a command table: `byte & mask == opcode` selects it.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub opcode: u8,
    pub mask: u8,
    /// Parameter bytes that follow the command byte.
    pub params: u8,
    pub op: CommandOp,
}

const fn cmd(opcode: u8, mask: u8, params: u8, op: CommandOp) -> Command {
    Command {
        opcode,
        mask,
        params,
        op,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub page: u8,
    pub column: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct DisplayVariant {
    pub name: &'static str,
    pub columns: u8,
    pub pages: u8,
    /// 7-bit bus address; compared after applying `i2c_mask`.
    pub i2c_address: u8,
    pub i2c_mask: u8,
    pub reset_cursor: Cursor,
    pub reset_contrast: u8,
    pub reset_flags: DisplayFlags,
    pub reset_mode: AddressingMode,
    /// In page addressing mode, wrapping past the last column also moves to
    /// the next page.
    pub page_mode_wraps_page: bool,
    pub commands: &'static [Command],
}

impl DisplayVariant {
    pub fn lookup(&self, byte: u8) -> Option<&'static Command> {
        self.commands.iter().find(|c| byte & c.mask == c.opcode)
    }
}

use CommandOp::*;

const SSD1306_COMMANDS: [Command; 27] = [
    cmd(0x00, 0xF0, 0, ColumnLow),
    cmd(0x10, 0xF0, 0, ColumnHigh),
    cmd(0x20, 0xFF, 1, MemoryMode),
    cmd(0x21, 0xFF, 2, ColumnWindow),
    cmd(0x22, 0xFF, 2, PageWindow),
    cmd(0x26, 0xFE, 6, HorizontalScroll),
    cmd(0x29, 0xFF, 5, DiagonalScroll),
    cmd(0x2A, 0xFF, 5, DiagonalScroll),
    cmd(0x2E, 0xFF, 0, ScrollOff),
    cmd(0x2F, 0xFF, 0, ScrollOn),
    cmd(0x40, 0xC0, 0, StartLine),
    cmd(0x81, 0xFF, 1, Contrast),
    cmd(0x8D, 0xFF, 1, ChargePump),
    cmd(0xA0, 0xFE, 0, SegmentRemap),
    cmd(0xA3, 0xFF, 2, VerticalScrollArea),
    cmd(0xA4, 0xFE, 0, EntireOn),
    cmd(0xA6, 0xFE, 0, Invert),
    cmd(0xA8, 0xFF, 1, Setting),
    cmd(0xAE, 0xFE, 0, Power),
    cmd(0xB0, 0xF8, 0, Page),
    cmd(0xC0, 0xF7, 0, ComScan),
    cmd(0xD3, 0xFF, 1, Setting),
    cmd(0xD5, 0xFF, 1, Setting),
    cmd(0xD9, 0xFF, 1, Setting),
    cmd(0xDA, 0xFF, 1, Setting),
    cmd(0xDB, 0xFF, 1, Setting),
    cmd(0xE3, 0xFF, 0, Nop),
];

const SH1106_COMMANDS: [Command; 20] = [
    cmd(0x00, 0xF0, 0, ColumnLow),
    cmd(0x10, 0xF0, 0, ColumnHigh),
    // charge pump voltage
    cmd(0x30, 0xFC, 0, Nop),
    cmd(0x40, 0xC0, 0, StartLine),
    cmd(0x81, 0xFF, 1, Contrast),
    cmd(0xA0, 0xFE, 0, SegmentRemap),
    cmd(0xA4, 0xFE, 0, EntireOn),
    cmd(0xA6, 0xFE, 0, Invert),
    cmd(0xA8, 0xFF, 1, Setting),
    // DC-DC control mode
    cmd(0xAD, 0xFF, 1, Setting),
    cmd(0xAE, 0xFE, 0, Power),
    cmd(0xB0, 0xF8, 0, Page),
    cmd(0xC0, 0xF7, 0, ComScan),
    cmd(0xD3, 0xFF, 1, Setting),
    cmd(0xD5, 0xFF, 1, Setting),
    cmd(0xD9, 0xFF, 1, Setting),
    cmd(0xDA, 0xFF, 1, Setting),
    cmd(0xDB, 0xFF, 1, Setting),
    // read-modify-write start / end
    cmd(0xE0, 0xFF, 0, Nop),
    cmd(0xEE, 0xFF, 0, Nop),
];

pub const SSD1306: DisplayVariant = DisplayVariant {
    name: "ssd1306",
    columns: 128,
    pages: 8,
    i2c_address: 0x3C,
    i2c_mask: 0xFE,
    reset_cursor: Cursor { page: 0, column: 0 },
    reset_contrast: 0x7F,
    reset_flags: DisplayFlags::empty(),
    reset_mode: AddressingMode::Page,
    page_mode_wraps_page: true,
    commands: &SSD1306_COMMANDS,
};

pub const SH1106: DisplayVariant = DisplayVariant {
    name: "sh1106",
    columns: 132,
    pages: 8,
    i2c_address: 0x3C,
    i2c_mask: 0xFE,
    reset_cursor: Cursor {
        page: 0,
        column: 0x80,
    },
    reset_contrast: 0x80,
    reset_flags: DisplayFlags::SEGMENT_REMAP_0.union(DisplayFlags::COM_SCAN_NORMAL),
    reset_mode: AddressingMode::Page,
    page_mode_wraps_page: false,
    commands: &SH1106_COMMANDS,
};

/// Scroll parameters as last programmed; the model does not animate them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScrollSetup {
    pub left: bool,
    pub vertical_offset: u8,
    pub start_page: u8,
    pub end_page: u8,
    pub interval: u8,
    pub fixed_rows: u8,
    pub scroll_rows: u8,
}

#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    opcode: u8,
    op: CommandOp,
    params: [u8; 6],
    received: usize,
    expected: usize,
}

#[derive(Debug, Serialize)]
pub struct Display {
    name: String,
    #[serde(skip)]
    variant: &'static DisplayVariant,
    #[serde(skip)]
    lines: LineSet,
    columns: u8,
    pages: u8,
    #[serde(skip)]
    vram: Vec<u8>,
    #[serde(skip)]
    cursor: Cursor,
    #[serde(skip)]
    flags: DisplayFlags,
    mode: AddressingMode,
    column_window: (u8, u8),
    page_window: (u8, u8),
    contrast: u8,
    start_line: u8,
    scroll: ScrollSetup,
    #[serde(skip)]
    pending: Option<PendingCommand>,
    /// Data mode selected, by the DC pin or a TWI control byte.
    data_mode: bool,
    twi_selected: Option<u8>,
    twi_index: usize,
    dirty: bool,
}

impl Display {
    pub const SPI_IN: usize = 0;
    pub const CS: usize = 1;
    pub const DC: usize = 2;
    pub const RESET: usize = 3;
    /// Cursor after each data write, `page << 8 | column`.
    pub const ADDR: usize = 4;
    /// TWI messages from the bus master.
    pub const TWI_IN: usize = 5;
    /// ACK / read replies to the bus master.
    pub const TWI_OUT: usize = 6;

    pub fn attach(
        sys: &mut System,
        name: &str,
        variant: &'static DisplayVariant,
        width: u32,
        height: u32,
    ) -> PeripheralId {
        let columns = width.clamp(1, variant.columns as u32) as u8;
        let pages = (height / 8).clamp(1, variant.pages as u32) as u8;
        sys.attach(name, |sys, id| {
            let lines = sys.alloc_lines(
                Some(id),
                &["sdin", "cs", "dc", "reset", "addr", "twi_in", "twi_out"],
                LineFlags::empty(),
            );
            for input in [Self::SPI_IN, Self::CS, Self::DC, Self::RESET, Self::TWI_IN] {
                sys.subscribe(lines.get(input), id, input as u32);
            }
            let mut display = Self {
                name: name.to_string(),
                variant,
                lines,
                columns,
                pages,
                vram: vec![0; columns as usize * pages as usize],
                cursor: variant.reset_cursor,
                flags: variant.reset_flags,
                mode: variant.reset_mode,
                column_window: (0, columns - 1),
                page_window: (0, pages - 1),
                contrast: variant.reset_contrast,
                start_line: 0,
                scroll: ScrollSetup::default(),
                pending: None,
                data_mode: false,
                twi_selected: None,
                twi_index: 0,
                dirty: false,
            };
            display.power_on(sys);
            debug!(peripheral = %name, variant = variant.name, columns, pages, "display attached");
            display
        })
    }

    pub fn line(&self, index: usize) -> LineId {
        self.lines.get(index)
    }

    pub fn variant(&self) -> &'static DisplayVariant {
        self.variant
    }

    pub fn columns(&self) -> usize {
        self.columns as usize
    }

    pub fn pages(&self) -> usize {
        self.pages as usize
    }

    /// Video memory, page-major: byte `page * columns + column`.
    pub fn vram(&self) -> &[u8] {
        &self.vram
    }

    pub fn vram_page(&self, page: usize) -> &[u8] {
        let start = page * self.columns as usize;
        &self.vram[start..start + self.columns as usize]
    }

    /// Pixel at `(x, y)`; bit `y % 8` of the byte in page `y / 8`.
    pub fn pixel(&self, x: usize, y: usize) -> bool {
        let page = y / 8;
        if x >= self.columns as usize || page >= self.pages as usize {
            return false;
        }
        self.vram[page * self.columns as usize + x] & (1 << (y % 8)) != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Called by the renderer once it has redrawn.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn flags(&self) -> DisplayFlags {
        self.flags
    }

    pub fn contrast(&self) -> u8 {
        self.contrast
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        self.mode
    }

    pub fn column_window(&self) -> (u8, u8) {
        self.column_window
    }

    pub fn page_window(&self) -> (u8, u8) {
        self.page_window
    }

    pub fn scroll(&self) -> ScrollSetup {
        self.scroll
    }

    pub fn start_line(&self) -> u8 {
        self.start_line
    }

    /// Command waiting for parameter bytes, or 0.
    pub fn command_register(&self) -> u8 {
        self.pending.map_or(0, |p| p.opcode)
    }

    fn power_on(&mut self, sys: &mut System) {
        self.vram.fill(0);
        self.cursor = self.variant.reset_cursor;
        self.flags = self.variant.reset_flags;
        self.mode = self.variant.reset_mode;
        self.column_window = (0, self.columns - 1);
        self.page_window = (0, self.pages - 1);
        self.contrast = self.variant.reset_contrast;
        self.start_line = 0;
        self.scroll = ScrollSetup::default();
        self.pending = None;
        self.dirty = true;
        self.report_cursor(sys);
    }

    fn report_cursor(&self, sys: &mut System) {
        let addr = ((self.cursor.page as u32) << 8) | self.cursor.column as u32;
        sys.raise(self.lines.get(Self::ADDR), addr);
    }

    fn write_data(&mut self, sys: &mut System, byte: u8) {
        let Cursor { page, column } = self.cursor;
        if page < self.pages && column < self.columns {
            self.vram[page as usize * self.columns as usize + column as usize] = byte;
        }
        self.advance_cursor();
        self.dirty = true;
        self.report_cursor(sys);
    }

    fn advance_cursor(&mut self) {
        let (col_start, col_end) = self.column_window;
        let (page_start, page_end) = self.page_window;
        let c = &mut self.cursor;
        match self.mode {
            AddressingMode::Page => {
                c.column = c.column.wrapping_add(1);
                if c.column >= self.columns {
                    c.column = 0;
                    if self.variant.page_mode_wraps_page {
                        c.page = (c.page + 1) % self.pages;
                    }
                }
            }
            AddressingMode::Horizontal => {
                if c.column >= col_end {
                    c.column = col_start;
                    c.page = if c.page >= page_end { page_start } else { c.page + 1 };
                } else {
                    c.column += 1;
                }
            }
            AddressingMode::Vertical => {
                if c.page >= page_end {
                    c.page = page_start;
                    c.column = if c.column >= col_end { col_start } else { c.column + 1 };
                } else {
                    c.page += 1;
                }
            }
        }
    }

    fn write_command(&mut self, byte: u8) {
        if let Some(mut pending) = self.pending {
            pending.params[pending.received] = byte;
            pending.received += 1;
            if pending.received < pending.expected {
                self.pending = Some(pending);
                return;
            }
            self.pending = None;
            let params = pending.params;
            self.execute(pending.op, pending.opcode, &params[..pending.expected]);
            return;
        }

        let Some(command) = self.variant.lookup(byte) else {
            warn!(peripheral = %self.name, command = byte, "unknown command ignored");
            return;
        };
        if command.params == 0 {
            self.execute(command.op, byte, &[]);
        } else {
            trace!(peripheral = %self.name, command = byte, params = command.params, "command pending");
            self.pending = Some(PendingCommand {
                opcode: byte,
                op: command.op,
                params: [0; 6],
                received: 0,
                expected: command.params as usize,
            });
        }
    }

    fn execute(&mut self, op: CommandOp, byte: u8, params: &[u8]) {
        trace!(peripheral = %self.name, command = byte, ?params, "command");
        let max_column = self.columns - 1;
        match op {
            ColumnLow => self.cursor.column = (self.cursor.column & 0xF0) | (byte & 0x0F),
            ColumnHigh => {
                self.cursor.column = (self.cursor.column & 0x0F) | ((byte & 0x0F) << 4)
            }
            Page => self.cursor.page = (byte & 0x07).min(self.pages - 1),
            StartLine => self.start_line = byte & 0x3F,
            Contrast => {
                self.contrast = params[0];
                self.dirty = true;
            }
            ChargePump => self.flags.set(DisplayFlags::CHARGE_PUMP, params[0] & 0x04 != 0),
            MemoryMode => match params[0] & 0x03 {
                0 => self.mode = AddressingMode::Horizontal,
                1 => self.mode = AddressingMode::Vertical,
                2 => self.mode = AddressingMode::Page,
                _ => warn!(peripheral = %self.name, "invalid addressing mode ignored"),
            },
            ColumnWindow => {
                let start = params[0].min(max_column);
                let end = params[1].min(max_column).max(start);
                self.column_window = (start, end);
                self.cursor.column = start;
            }
            PageWindow => {
                let last = self.pages - 1;
                let start = (params[0] & 0x07).min(last);
                let end = (params[1] & 0x07).min(last).max(start);
                self.page_window = (start, end);
                self.cursor.page = start;
            }
            HorizontalScroll => {
                self.flags.remove(DisplayFlags::SCROLLING);
                self.scroll.left = byte & 1 != 0;
                self.scroll.vertical_offset = 0;
                self.scroll.start_page = params[1] & 0x07;
                self.scroll.interval = params[2] & 0x07;
                self.scroll.end_page = params[3] & 0x07;
            }
            DiagonalScroll => {
                self.flags.remove(DisplayFlags::SCROLLING);
                self.scroll.left = byte == 0x2A;
                self.scroll.start_page = params[1] & 0x07;
                self.scroll.interval = params[2] & 0x07;
                self.scroll.end_page = params[3] & 0x07;
                self.scroll.vertical_offset = params[4] & 0x3F;
            }
            VerticalScrollArea => {
                self.scroll.fixed_rows = params[0] & 0x3F;
                self.scroll.scroll_rows = params[1] & 0x7F;
            }
            ScrollOff => self.flags.remove(DisplayFlags::SCROLLING),
            ScrollOn => self.flags.insert(DisplayFlags::SCROLLING),
            SegmentRemap => self.flags.set(DisplayFlags::SEGMENT_REMAP_0, byte & 1 == 0),
            ComScan => self.flags.set(DisplayFlags::COM_SCAN_NORMAL, byte & 0x08 == 0),
            EntireOn => {
                self.flags.set(DisplayFlags::ENTIRE_ON, byte & 1 != 0);
                self.dirty = true;
            }
            Invert => {
                self.flags.set(DisplayFlags::INVERTED, byte & 1 != 0);
                self.dirty = true;
            }
            Power => {
                self.flags.set(DisplayFlags::DISPLAY_ON, byte & 1 != 0);
                self.dirty = true;
            }
            Setting | Nop => {}
        }
    }

    fn byte_in(&mut self, sys: &mut System, byte: u8) {
        if self.data_mode {
            self.write_data(sys, byte);
        } else {
            self.write_command(byte);
        }
    }

    fn reply(&self, sys: &mut System, msg: TwiMessage) {
        sys.raise(self.lines.get(Self::TWI_OUT), msg.pack());
    }

    fn twi_message(&mut self, sys: &mut System, msg: TwiMessage) {
        if msg.has(TwiCond::STOP) {
            self.twi_selected = None;
        }
        if msg.has(TwiCond::START) {
            self.twi_selected = None;
            self.twi_index = 0;
            if (msg.addr >> 1) & self.variant.i2c_mask == self.variant.i2c_address {
                self.twi_selected = Some(msg.addr);
                trace!(peripheral = %self.name, addr = msg.addr, "selected");
                self.reply(sys, TwiMessage::new(TwiCond::ACK, msg.addr, 1));
            }
            return;
        }
        let Some(addr) = self.twi_selected else {
            return;
        };

        if msg.has(TwiCond::WRITE) {
            self.reply(sys, TwiMessage::new(TwiCond::ACK, addr, 1));
            if self.twi_index == 0 {
                // Co must be clear and only D/C# may be set
                if msg.data & !0x40 != 0 {
                    sys.fatal(
                        &self.name,
                        format!("unsupported control byte {:#04x}", msg.data),
                    );
                    return;
                }
                self.data_mode = msg.data != 0;
            } else {
                self.byte_in(sys, msg.data);
            }
            self.twi_index += 1;
        }

        if msg.has(TwiCond::READ) {
            warn!(peripheral = %self.name, "reads are not supported on the serial interface");
            self.reply(sys, TwiMessage::new(TwiCond::READ, addr, 0));
            self.twi_index += 1;
        }
    }
}

impl Peripheral for Display {
    fn reset(&mut self, sys: &mut System) {
        self.power_on(sys);
    }

    fn on_signal(&mut self, sys: &mut System, input: u32, signal: Signal) {
        match input as usize {
            Self::SPI_IN => {
                // chip select is active low
                if sys.line_value(self.lines.get(Self::CS)) != 0 {
                    return;
                }
                self.byte_in(sys, signal.value as u8);
            }
            Self::DC => self.data_mode = signal.value != 0,
            Self::RESET => {
                if signal.is_falling_edge() {
                    debug!(peripheral = %self.name, "reset");
                    self.power_on(sys);
                }
            }
            Self::TWI_IN => self.twi_message(sys, TwiMessage::unpack(signal.value)),
            _ => {}
        }
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        let mut v = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = v.as_object_mut() {
            obj.insert("variant".into(), self.variant.name.into());
            obj.insert("page".into(), self.cursor.page.into());
            obj.insert("column".into(), self.cursor.column.into());
            obj.insert("flags".into(), self.flags.bits().into());
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulationConfig;

    fn setup(variant: &'static DisplayVariant) -> (System, PeripheralId, LineSet) {
        let mut sys = System::new(SimulationConfig::default(), 0x100);
        let id = Display::attach(&mut sys, "oled", variant, variant.columns as u32, 64);
        let lines = sys.get::<Display>(id).unwrap().lines;
        (sys, id, lines)
    }

    fn command(sys: &mut System, lines: LineSet, bytes: &[u8]) {
        sys.raise(lines.get(Display::DC), 0);
        for b in bytes {
            sys.raise(lines.get(Display::SPI_IN), *b as u32);
        }
    }

    fn data(sys: &mut System, lines: LineSet, bytes: &[u8]) {
        sys.raise(lines.get(Display::DC), 1);
        for b in bytes {
            sys.raise(lines.get(Display::SPI_IN), *b as u32);
        }
    }

    #[test]
    fn test_table_lookup_by_mask() {
        assert_eq!(SSD1306.lookup(0xB3).unwrap().op, CommandOp::Page);
        assert_eq!(SSD1306.lookup(0xC8).unwrap().op, CommandOp::ComScan);
        assert_eq!(SSD1306.lookup(0x27).unwrap().params, 6);
        assert!(SH1106.lookup(0x20).is_none());
        assert!(SSD1306.lookup(0xFF).is_none());
    }

    #[test]
    fn test_multi_byte_command_consumes_params() {
        let (mut sys, id, lines) = setup(&SSD1306);
        command(&mut sys, lines, &[0x81]);
        assert_eq!(sys.get::<Display>(id).unwrap().command_register(), 0x81);
        command(&mut sys, lines, &[0x10]);
        let d = sys.get::<Display>(id).unwrap();
        assert_eq!(d.contrast(), 0x10);
        assert_eq!(d.command_register(), 0);
        // 0x10 was a parameter, not a column command
        assert_eq!(d.cursor().column, 0);

        command(&mut sys, lines, &[0x26, 0x00, 0x01, 0x05, 0x06, 0x00]);
        assert_eq!(sys.get::<Display>(id).unwrap().command_register(), 0x26);
        command(&mut sys, lines, &[0xFF, 0x2F]);
        let d = sys.get::<Display>(id).unwrap();
        assert_eq!(d.scroll().start_page, 1);
        assert_eq!(d.scroll().end_page, 6);
        assert!(d.flags().contains(DisplayFlags::SCROLLING));
    }

    #[test]
    fn test_horizontal_window_wraps() {
        let (mut sys, id, lines) = setup(&SSD1306);
        // horizontal mode, columns 10..13, page 2 only
        command(&mut sys, lines, &[0x20, 0x00, 0x21, 10, 13, 0x22, 2, 2]);
        data(&mut sys, lines, &[1, 2, 3, 4]);
        let d = sys.get::<Display>(id).unwrap();
        assert_eq!(d.cursor(), Cursor { page: 2, column: 10 });
        assert_eq!(&d.vram_page(2)[10..14], &[1, 2, 3, 4]);
        data(&mut sys, lines, &[5]);
        let d = sys.get::<Display>(id).unwrap();
        assert_eq!(d.vram_page(2)[10], 5);
        assert_eq!(d.cursor(), Cursor { page: 2, column: 11 });
    }

    #[test]
    fn test_column_window_clamped_to_panel_width() {
        let mut sys = System::new(SimulationConfig::default(), 0x100);
        let id = Display::attach(&mut sys, "oled", &SSD1306, 64, 32);
        let lines = sys.get::<Display>(id).unwrap().lines;
        command(&mut sys, lines, &[0x21, 60, 127]);
        let d = sys.get::<Display>(id).unwrap();
        assert_eq!(d.column_window(), (60, 63));
        assert_eq!(d.cursor().column, 60);
    }

    #[test]
    fn test_horizontal_full_width_advances_page() {
        let (mut sys, id, lines) = setup(&SSD1306);
        command(&mut sys, lines, &[0x20, 0x00, 0x22, 0, 7]);
        data(&mut sys, lines, &[0xAA; 128]);
        assert_eq!(
            sys.get::<Display>(id).unwrap().cursor(),
            Cursor { page: 1, column: 0 }
        );
    }

    #[test]
    fn test_vertical_mode_walks_pages_first() {
        let (mut sys, id, lines) = setup(&SSD1306);
        command(&mut sys, lines, &[0x20, 0x01, 0x22, 0, 1]);
        data(&mut sys, lines, &[1, 2, 3]);
        let d = sys.get::<Display>(id).unwrap();
        assert_eq!(d.vram_page(0)[0], 1);
        assert_eq!(d.vram_page(1)[0], 2);
        assert_eq!(d.vram_page(0)[1], 3);
        assert_eq!(d.cursor(), Cursor { page: 1, column: 1 });
    }

    #[test]
    fn test_page_mode_column_nibbles() {
        let (mut sys, id, lines) = setup(&SSD1306);
        command(&mut sys, lines, &[0xB3, 0x05, 0x12]);
        data(&mut sys, lines, &[0x81]);
        let d = sys.get::<Display>(id).unwrap();
        assert_eq!(d.vram_page(3)[0x25], 0x81);
        assert!(d.pixel(0x25, 24));
        assert!(d.pixel(0x25, 31));
        assert!(!d.pixel(0x25, 25));
    }

    #[test]
    fn test_chip_select_high_ignores_bytes() {
        let (mut sys, id, lines) = setup(&SSD1306);
        sys.raise(lines.get(Display::CS), 1);
        data(&mut sys, lines, &[0xFF]);
        assert_eq!(sys.get::<Display>(id).unwrap().vram_page(0)[0], 0);
    }

    #[test]
    fn test_unknown_command_is_not_fatal() {
        let (mut sys, _, lines) = setup(&SH1106);
        command(&mut sys, lines, &[0x20]);
        assert!(!sys.is_halted());
    }

    #[test]
    fn test_reset_falling_edge_restores_defaults() {
        let (mut sys, id, lines) = setup(&SH1106);
        command(&mut sys, lines, &[0xB2, 0x00, 0x10, 0xA7]);
        data(&mut sys, lines, &[0x55, 0x66]);
        sys.get_mut::<Display>(id).unwrap().clear_dirty();

        sys.raise(lines.get(Display::RESET), 1);
        sys.raise(lines.get(Display::RESET), 0);
        let d = sys.get::<Display>(id).unwrap();
        assert!(d.vram().iter().all(|b| *b == 0));
        assert_eq!(d.cursor(), Cursor { page: 0, column: 0x80 });
        assert_eq!(d.contrast(), 0x80);
        assert!(!d.flags().contains(DisplayFlags::INVERTED));
        assert!(d.flags().contains(DisplayFlags::COM_SCAN_NORMAL));
        assert!(d.is_dirty());
    }

    #[test]
    fn test_sh1106_page_mode_stays_on_page() {
        let (mut sys, id, lines) = setup(&SH1106);
        command(&mut sys, lines, &[0xB1, 0x03, 0x18]);
        data(&mut sys, lines, &[1, 2]);
        let d = sys.get::<Display>(id).unwrap();
        // 0x83 is the last of 132 columns
        assert_eq!(d.cursor(), Cursor { page: 1, column: 1 });
    }

    #[test]
    fn test_twi_control_byte_selects_mode() {
        let (mut sys, id, lines) = setup(&SSD1306);
        let replies = sys.alloc_lines(None, &["master_in"], LineFlags::empty()).get(0);
        sys.connect(lines.get(Display::TWI_OUT), replies);
        let twi_in = lines.get(Display::TWI_IN);
        let send = |sys: &mut System, cond: TwiCond, addr: u8, data: u8| {
            sys.raise(twi_in, TwiMessage::new(cond, addr, data).pack());
        };

        send(&mut sys, TwiCond::START | TwiCond::ADDR | TwiCond::WRITE, 0x78, 0);
        assert!(TwiMessage::unpack(sys.line_value(replies)).has(TwiCond::ACK));
        send(&mut sys, TwiCond::WRITE, 0x78, 0x40);
        send(&mut sys, TwiCond::WRITE, 0x78, 0x3C);
        send(&mut sys, TwiCond::STOP, 0x78, 0);
        assert_eq!(sys.get::<Display>(id).unwrap().vram_page(0)[0], 0x3C);

        // other address: ignored
        send(&mut sys, TwiCond::START | TwiCond::ADDR | TwiCond::WRITE, 0x50, 0);
        send(&mut sys, TwiCond::WRITE, 0x50, 0x40);
        send(&mut sys, TwiCond::WRITE, 0x50, 0x11);
        assert_eq!(sys.get::<Display>(id).unwrap().vram_page(0)[1], 0);
    }

    #[test]
    fn test_twi_reserved_control_bits_are_fatal() {
        let (mut sys, _, lines) = setup(&SSD1306);
        let twi_in = lines.get(Display::TWI_IN);
        let start = TwiMessage::new(TwiCond::START | TwiCond::ADDR | TwiCond::WRITE, 0x7A, 0);
        sys.raise(twi_in, start.pack());
        sys.raise(twi_in, TwiMessage::new(TwiCond::WRITE, 0x7A, 0x80).pack());
        assert!(sys.is_halted());
        assert!(sys.check().is_err());
    }
}
