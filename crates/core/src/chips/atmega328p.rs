// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! ATmega328P register map.

use crate::bus::RegBit;
use crate::interrupt::InterruptVector;
use crate::peripherals::{
    AdcConfig, MuxMode, PortConfig, SpiConfig, TimerConfig, TriggerSource, TwiConfig, UartConfig,
    VrefSource,
};

pub const IO_SIZE: usize = 0x900;

pub const TIMER0_COMPA_VECTOR: u8 = 14;
pub const TIMER0_COMPB_VECTOR: u8 = 15;
pub const TIMER0_OVF_VECTOR: u8 = 16;
pub const USART_RX_VECTOR: u8 = 18;
pub const USART_UDRE_VECTOR: u8 = 19;
pub const USART_TX_VECTOR: u8 = 20;
pub const SPI_VECTOR: u8 = 17;
pub const ADC_VECTOR: u8 = 21;
pub const TWI_VECTOR: u8 = 24;

pub const PORTB: PortConfig = PortConfig {
    name: 'B',
    r_pin: 0x23,
    r_ddr: 0x24,
    r_port: 0x25,
};
pub const PORTC: PortConfig = PortConfig {
    name: 'C',
    r_pin: 0x26,
    r_ddr: 0x27,
    r_port: 0x28,
};
pub const PORTD: PortConfig = PortConfig {
    name: 'D',
    r_pin: 0x29,
    r_ddr: 0x2A,
    r_port: 0x2B,
};

pub const PORTS: [PortConfig; 3] = [PORTB, PORTC, PORTD];

const SPCR: u16 = 0x4C;
const SPSR: u16 = 0x4D;

pub const SPI: SpiConfig = SpiConfig {
    r_spdr: 0x4E,
    r_spcr: SPCR,
    spe: RegBit::new(SPCR, 6),
    mstr: RegBit::new(SPCR, 4),
    spr: [RegBit::new(SPCR, 0), RegBit::new(SPCR, 1), RegBit::new(SPSR, 0)],
    vector: InterruptVector::new(SPI_VECTOR, RegBit::new(SPCR, 7), RegBit::new(SPSR, 7)),
};

const TWSR: u16 = 0xB9;
const TWCR: u16 = 0xBC;

pub const TWI: TwiConfig = TwiConfig {
    r_twbr: 0xB8,
    r_twsr: TWSR,
    r_twar: 0xBA,
    r_twdr: 0xBB,
    r_twcr: TWCR,
    twen: RegBit::new(TWCR, 2),
    twea: RegBit::new(TWCR, 6),
    twsta: RegBit::new(TWCR, 5),
    twsto: RegBit::new(TWCR, 4),
    twwc: RegBit::new(TWCR, 3),
    twps: [RegBit::new(TWSR, 0), RegBit::new(TWSR, 1)],
    tws: RegBit::field(TWSR, 3, 0x1F),
    vector: InterruptVector::new(TWI_VECTOR, RegBit::new(TWCR, 0), RegBit::new(TWCR, 7)),
};

const TCCR0A: u16 = 0x44;
const TCCR0B: u16 = 0x45;
const TIMSK0: u16 = 0x6E;
const TIFR0: u16 = 0x35;

pub const TIMER0: TimerConfig = TimerConfig {
    r_tccra: TCCR0A,
    r_tccrb: TCCR0B,
    r_tcnt: 0x46,
    r_ocra: 0x47,
    r_ocrb: 0x48,
    wgm: [
        RegBit::new(TCCR0A, 0),
        RegBit::new(TCCR0A, 1),
        RegBit::new(TCCR0B, 3),
    ],
    cs: [
        RegBit::new(TCCR0B, 0),
        RegBit::new(TCCR0B, 1),
        RegBit::new(TCCR0B, 2),
    ],
    overflow: InterruptVector::new(TIMER0_OVF_VECTOR, RegBit::new(TIMSK0, 0), RegBit::new(TIFR0, 0)),
    compa: InterruptVector::new(TIMER0_COMPA_VECTOR, RegBit::new(TIMSK0, 1), RegBit::new(TIFR0, 1)),
    compb: InterruptVector::new(TIMER0_COMPB_VECTOR, RegBit::new(TIMSK0, 2), RegBit::new(TIFR0, 2)),
};

const ADMUX: u16 = 0x7C;
const ADCSRA: u16 = 0x7A;
const ADCSRB: u16 = 0x7B;

const ADC_MUXMODE: [MuxMode; 16] = [
    MuxMode::Single(0),
    MuxMode::Single(1),
    MuxMode::Single(2),
    MuxMode::Single(3),
    MuxMode::Single(4),
    MuxMode::Single(5),
    MuxMode::Single(6),
    MuxMode::Single(7),
    MuxMode::Temp,
    MuxMode::None,
    MuxMode::None,
    MuxMode::None,
    MuxMode::None,
    MuxMode::None,
    MuxMode::Ref(1100),
    MuxMode::Ref(0),
];

pub const ADC: AdcConfig = AdcConfig {
    r_admux: ADMUX,
    mux: [
        RegBit::new(ADMUX, 0),
        RegBit::new(ADMUX, 1),
        RegBit::new(ADMUX, 2),
        RegBit::new(ADMUX, 3),
        RegBit::NONE,
        RegBit::NONE,
    ],
    refs: [RegBit::new(ADMUX, 6), RegBit::new(ADMUX, 7), RegBit::NONE],
    ref_values: [
        VrefSource::Aref,
        VrefSource::Avcc,
        VrefSource::Aref,
        VrefSource::Internal(1100),
        VrefSource::Aref,
        VrefSource::Aref,
        VrefSource::Aref,
        VrefSource::Aref,
    ],
    adlar: RegBit::new(ADMUX, 5),
    r_adcsra: ADCSRA,
    aden: RegBit::new(ADCSRA, 7),
    adsc: RegBit::new(ADCSRA, 6),
    adate: RegBit::new(ADCSRA, 5),
    adps: [
        RegBit::new(ADCSRA, 0),
        RegBit::new(ADCSRA, 1),
        RegBit::new(ADCSRA, 2),
    ],
    r_adcl: 0x78,
    r_adch: 0x79,
    r_adcsrb: ADCSRB,
    adts: [
        RegBit::new(ADCSRB, 0),
        RegBit::new(ADCSRB, 1),
        RegBit::new(ADCSRB, 2),
        RegBit::NONE,
    ],
    trigger_sources: [
        TriggerSource::FreeRunning,
        TriggerSource::AnalogComparator,
        TriggerSource::ExternalInterrupt0,
        TriggerSource::Timer0CompareA,
        TriggerSource::Timer0Overflow,
        TriggerSource::Timer1CompareB,
        TriggerSource::Timer1Overflow,
        TriggerSource::Timer1Capture,
        TriggerSource::Reserved,
        TriggerSource::Reserved,
        TriggerSource::Reserved,
        TriggerSource::Reserved,
        TriggerSource::Reserved,
        TriggerSource::Reserved,
        TriggerSource::Reserved,
        TriggerSource::Reserved,
    ],
    ipr: RegBit::NONE,
    muxmode: &ADC_MUXMODE,
    vector: InterruptVector::new(ADC_VECTOR, RegBit::new(ADCSRA, 3), RegBit::new(ADCSRA, 4)),
};

const UCSRA: u16 = 0xC0;
const UCSRB: u16 = 0xC1;
const UCSRC: u16 = 0xC2;

pub const USART0: UartConfig = UartConfig {
    r_udr: 0xC6,
    r_ucsra: UCSRA,
    r_ucsrb: UCSRB,
    r_ucsrc: UCSRC,
    r_ubrrl: 0xC4,
    r_ubrrh: 0xC5,
    rxen: RegBit::new(UCSRB, 4),
    txen: RegBit::new(UCSRB, 3),
    u2x: RegBit::new(UCSRA, 1),
    dor: RegBit::new(UCSRA, 3),
    ucsz: [RegBit::new(UCSRC, 1), RegBit::new(UCSRC, 2), RegBit::new(UCSRB, 2)],
    upm: RegBit::field(UCSRC, 4, 0x3),
    usbs: RegBit::new(UCSRC, 3),
    rxc: InterruptVector::new(USART_RX_VECTOR, RegBit::new(UCSRB, 7), RegBit::new(UCSRA, 7)),
    txc: InterruptVector::new(USART_TX_VECTOR, RegBit::new(UCSRB, 6), RegBit::new(UCSRA, 6)),
    udrc: InterruptVector::new(USART_UDRE_VECTOR, RegBit::new(UCSRB, 5), RegBit::new(UCSRA, 5)),
};
