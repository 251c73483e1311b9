// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Per-chip register maps and the function that instantiates a chip's
//! peripheral set into a [`System`].

pub mod atmega328p;
pub mod atmega32u4;

pub use labwired_avr_config::ChipKind;

use crate::peripherals::{
    Adc, AdcConfig, IoPort, PortConfig, Spi, SpiConfig, Timer8, TimerConfig, Twi, TwiConfig, Uart,
    UartConfig,
};
use crate::usb::{UsbConfig, UsbController};
use crate::{PeripheralId, SimulationConfig, System};
use tracing::info;

/// Static description of a chip: register file size and the peripheral
/// register maps.
#[derive(Debug, Clone, Copy)]
pub struct ChipDescriptor {
    pub name: &'static str,
    pub io_size: usize,
    pub ports: &'static [PortConfig],
    pub adc: AdcConfig,
    pub spi: SpiConfig,
    pub twi: TwiConfig,
    pub timer0: TimerConfig,
    pub uart: UartConfig,
    pub usb: Option<UsbConfig>,
}

pub const ATMEGA328P: ChipDescriptor = ChipDescriptor {
    name: "atmega328p",
    io_size: atmega328p::IO_SIZE,
    ports: &atmega328p::PORTS,
    adc: atmega328p::ADC,
    spi: atmega328p::SPI,
    twi: atmega328p::TWI,
    timer0: atmega328p::TIMER0,
    uart: atmega328p::USART0,
    usb: None,
};

pub const ATMEGA32U4: ChipDescriptor = ChipDescriptor {
    name: "atmega32u4",
    io_size: atmega32u4::IO_SIZE,
    ports: &atmega32u4::PORTS,
    adc: atmega32u4::ADC,
    spi: atmega32u4::SPI,
    twi: atmega32u4::TWI,
    timer0: atmega32u4::TIMER0,
    uart: atmega32u4::USART1,
    usb: Some(atmega32u4::USB),
};

pub fn descriptor(kind: ChipKind) -> &'static ChipDescriptor {
    match kind {
        ChipKind::Atmega328p => &ATMEGA328P,
        ChipKind::Atmega32u4 => &ATMEGA32U4,
    }
}

/// Ids of the on-chip peripherals after [`instantiate`].
#[derive(Debug, Clone)]
pub struct ChipPeripherals {
    pub ports: Vec<(char, PeripheralId)>,
    pub adc: PeripheralId,
    pub spi: PeripheralId,
    pub twi: PeripheralId,
    pub timer0: PeripheralId,
    pub uart: PeripheralId,
    pub usb: Option<PeripheralId>,
}

impl ChipPeripherals {
    pub fn port(&self, letter: char) -> Option<PeripheralId> {
        let letter = letter.to_ascii_uppercase();
        self.ports
            .iter()
            .find(|(name, _)| *name == letter)
            .map(|(_, id)| *id)
    }
}

/// Creates a system sized for `chip` and attaches its peripherals.
pub fn build(chip: &ChipDescriptor, config: SimulationConfig) -> (System, ChipPeripherals) {
    let mut sys = System::new(config, chip.io_size);
    let peripherals = instantiate(&mut sys, chip);
    (sys, peripherals)
}

/// Attaches every on-chip peripheral of `chip` and ties the timer outputs
/// to the ADC auto-trigger inputs.
pub fn instantiate(sys: &mut System, chip: &ChipDescriptor) -> ChipPeripherals {
    let ports = chip
        .ports
        .iter()
        .map(|cfg| (cfg.name, IoPort::attach(sys, *cfg)))
        .collect();
    let timer0 = Timer8::attach(sys, "timer0", chip.timer0);
    let adc = Adc::attach(sys, "adc", chip.adc);
    let spi = Spi::attach(sys, "spi", chip.spi);
    let twi = Twi::attach(sys, "twi", chip.twi);
    let uart = Uart::attach(sys, "uart", chip.uart);
    let usb = chip.usb.map(|cfg| UsbController::attach(sys, "usb", cfg));

    let timer_lines = sys
        .get::<Timer8>(timer0)
        .map(|t| (t.line(Timer8::COMPA), t.line(Timer8::OVERFLOW)));
    let adc_lines = sys.get::<Adc>(adc).map(|a| a.lines());
    if let (Some((compa, ovf)), Some(lines)) = (timer_lines, adc_lines) {
        sys.connect(compa, lines.get(Adc::TRIGGER_BASE + 2));
        sys.connect(ovf, lines.get(Adc::TRIGGER_BASE + 3));
    }

    info!(
        chip = chip.name,
        peripherals = sys.peripheral_count(),
        "chip instantiated"
    );
    ChipPeripherals {
        ports,
        adc,
        spi,
        twi,
        timer0,
        uart,
        usb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_328p_has_three_ports_and_no_usb() {
        let (sys, chip) = build(descriptor(ChipKind::Atmega328p), SimulationConfig::default());
        assert_eq!(chip.ports.len(), 3);
        assert!(chip.usb.is_none());
        assert!(chip.port('b').is_some());
        assert!(chip.port('E').is_none());
        assert_eq!(sys.find_peripheral("portd"), chip.port('D'));
    }

    #[test]
    fn test_32u4_has_usb() {
        let (sys, chip) = build(descriptor(ChipKind::Atmega32u4), SimulationConfig::default());
        assert_eq!(chip.ports.len(), 5);
        assert_eq!(sys.find_peripheral("usb"), chip.usb);
    }

    #[test]
    fn test_uart_layout_per_chip() {
        let (sys, chip) = build(descriptor(ChipKind::Atmega32u4), SimulationConfig::default());
        assert_eq!(sys.find_peripheral("uart"), Some(chip.uart));
        assert_eq!(atmega32u4::USART1.r_udr, 0xCE);
        assert_eq!(atmega32u4::USART1.rxc.vector, atmega32u4::USART_RX_VECTOR);
        assert_eq!(atmega328p::USART0.r_udr, 0xC6);
        assert_eq!(atmega328p::USART0.udrc.vector, 19);
    }

    #[test]
    fn test_32u4_mux_table() {
        use crate::peripherals::MuxMode;
        let table = atmega32u4::ADC.muxmode;
        assert_eq!(table.len(), 64);
        assert_eq!(table[2], MuxMode::None);
        assert_eq!(table[39], MuxMode::Temp);
        assert_eq!(
            table[45],
            MuxMode::Diff {
                src: 5,
                diff: 1,
                gain: 10
            }
        );
        assert_eq!(
            table[58],
            MuxMode::Diff {
                src: 6,
                diff: 0,
                gain: 200
            }
        );
    }
}
