// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Per-endpoint register file and FIFO banks.

use crate::config::ClearPolarity;

/// Bytes per FIFO bank.
pub const BANK_SIZE: usize = 64;

bitflags::bitflags! {
    /// UEINTX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ueintx: u8 {
        const TXINI = 1 << 0;
        const STALLEDI = 1 << 1;
        const RXOUTI = 1 << 2;
        const RXSTPI = 1 << 3;
        const NAKOUTI = 1 << 4;
        const RWAL = 1 << 5;
        const NAKINI = 1 << 6;
        const FIFOCON = 1 << 7;
    }
}

/// UECONX bits.
pub const EPEN: u8 = 1 << 0;
pub const STALLRQC: u8 = 1 << 4;
pub const STALLRQ: u8 = 1 << 5;

/// UESTA0X bits.
pub const UNDERFI: u8 = 1 << 5;
pub const OVERFI: u8 = 1 << 6;
pub const CFGOK: u8 = 1 << 7;

/// UEIENX bit enabling the FIFO error (over/underflow) interrupt.
pub const FLERRE: u8 = 1 << 7;

/// Endpoint conditions that end up in UEINTX or UESTA0X.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpEvent {
    TxIn,
    Stalled,
    RxOut,
    RxSetup,
    NakOut,
    NakIn,
    Overflow,
    Underflow,
}

/// Why a transfer could not move data right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoError {
    /// Endpoint not enabled.
    Disabled,
    /// The other side still owns the bank.
    Busy,
    Empty,
    Full,
}

#[derive(Debug, Clone, Copy)]
struct Bank {
    bytes: [u8; BANK_SIZE],
    tail: usize,
}

impl Default for Bank {
    fn default() -> Self {
        Self {
            bytes: [0; BANK_SIZE],
            tail: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Endpoint {
    pub ueintx: Ueintx,
    pub ueconx: u8,
    pub uecfg0x: u8,
    pub uecfg1x: u8,
    pub uesta0x: u8,
    pub uesta1x: u8,
    pub ueienx: u8,
    banks: [Bank; 2],
    current_bank: usize,
    /// Direction of the last SETUP packet (device-to-host).
    pub setup_is_read: bool,
}

impl Endpoint {
    pub fn enabled(&self) -> bool {
        self.ueconx & EPEN != 0
    }

    pub fn stalled(&self) -> bool {
        self.ueconx & STALLRQ != 0
    }

    /// EPTYPE: 0 control, 1 isochronous, 2 bulk, 3 interrupt.
    pub fn ep_type(&self) -> u8 {
        self.uecfg0x >> 6
    }

    /// EPDIR set means IN (device to host).
    pub fn is_in(&self) -> bool {
        self.uecfg0x & 1 != 0
    }

    pub fn fifo_size(&self) -> usize {
        (8usize << ((self.uecfg1x >> 4) & 0x7)).min(BANK_SIZE)
    }

    pub fn count(&self) -> usize {
        self.banks[self.current_bank].tail
    }

    pub fn fifo_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn fifo_full(&self) -> bool {
        self.count() >= self.fifo_size()
    }

    /// Sets the flag for `event`. Returns true when its interrupt enable is
    /// set and the endpoint vector should fire.
    pub fn latch(&mut self, event: EpEvent) -> bool {
        let flag = match event {
            EpEvent::TxIn => Ueintx::TXINI,
            EpEvent::Stalled => Ueintx::STALLEDI,
            EpEvent::RxOut => Ueintx::RXOUTI,
            EpEvent::RxSetup => Ueintx::RXSTPI,
            EpEvent::NakOut => Ueintx::NAKOUTI,
            EpEvent::NakIn => Ueintx::NAKINI,
            EpEvent::Overflow => {
                self.uesta0x |= OVERFI;
                return self.ueienx & FLERRE != 0;
            }
            EpEvent::Underflow => {
                self.uesta0x |= UNDERFI;
                return self.ueienx & FLERRE != 0;
            }
        };
        self.ueintx |= flag;
        self.ueienx & flag.bits() != 0
    }

    /// UEINTX as the CPU reads it: RWAL reflects the FIFO state.
    pub fn read_ueintx(&mut self) -> u8 {
        let rwal = if self.is_in() {
            !self.fifo_full()
        } else {
            !self.fifo_empty()
        };
        self.ueintx.set(Ueintx::RWAL, rwal);
        self.ueintx.bits()
    }

    /// Applies a CPU write to UEINTX. Flags are only ever cleared here.
    pub fn write_ueintx(&mut self, value: u8, polarity: ClearPolarity) -> Ueintx {
        let written = match polarity {
            ClearPolarity::WriteOneToClear => Ueintx::from_bits_truncate(value),
            ClearPolarity::WriteZeroToClear => Ueintx::from_bits_truncate(!value),
        };
        let mut clear = self.ueintx & written;
        clear.remove(Ueintx::RWAL);

        // a control write keeps its data flags until the setup is acknowledged
        if self.ueintx.contains(Ueintx::RXSTPI) && !self.setup_is_read {
            clear &= Ueintx::RXSTPI | Ueintx::STALLEDI | Ueintx::NAKINI | Ueintx::NAKOUTI;
        }

        if clear.contains(Ueintx::RXSTPI) {
            self.ueintx.insert(Ueintx::TXINI);
            self.ueintx.remove(Ueintx::RXOUTI | Ueintx::RXSTPI);
            clear.remove(Ueintx::RXSTPI | Ueintx::TXINI | Ueintx::RXOUTI);
        }
        self.ueintx.remove(clear);
        clear
    }

    /// Guest side: UECONX write.
    pub fn write_ueconx(&mut self, value: u8) {
        if value & STALLRQC != 0 {
            self.ueconx &= !STALLRQ;
        }
        if value & STALLRQ != 0 {
            self.ueconx |= STALLRQ;
        }
        self.ueconx = (self.ueconx & !EPEN) | (value & EPEN);
    }

    pub fn write_uecfg0x(&mut self, value: u8) {
        self.uecfg0x = value;
        self.uesta0x &= !CFGOK;
    }

    /// Guest side: UECFG1X write. ALLOC completes the configuration and
    /// primes the flags for the endpoint's direction.
    pub fn write_uecfg1x(&mut self, value: u8) {
        self.uecfg1x = value;
        if value & (1 << 1) != 0 {
            self.uesta0x |= CFGOK;
        } else {
            self.uesta0x &= !CFGOK;
        }
        if self.ep_type() == 0 {
            self.ueintx.insert(Ueintx::TXINI);
        } else if self.is_in() {
            self.ueintx
                .insert(Ueintx::TXINI | Ueintx::RWAL | Ueintx::FIFOCON);
        } else {
            self.ueintx.remove(Ueintx::RXOUTI);
        }
    }

    /// Overflow and underflow flags can only be cleared, by writing 0.
    pub fn write_uesta0x(&mut self, value: u8) {
        let sticky = OVERFI | UNDERFI;
        self.uesta0x = (self.uesta0x & !sticky) | (value & sticky & self.uesta0x);
    }

    pub fn cpu_read_byte(&mut self) -> Result<u8, FifoError> {
        if !self.enabled() {
            return Err(FifoError::Disabled);
        }
        let bank = &mut self.banks[self.current_bank];
        if bank.tail == 0 {
            return Err(FifoError::Empty);
        }
        let v = bank.bytes[0];
        bank.bytes.copy_within(1..bank.tail, 0);
        bank.tail -= 1;
        Ok(v)
    }

    pub fn cpu_write_byte(&mut self, value: u8) -> Result<(), FifoError> {
        if !self.enabled() {
            return Err(FifoError::Disabled);
        }
        if self.fifo_full() {
            return Err(FifoError::Full);
        }
        let bank = &mut self.banks[self.current_bank];
        bank.bytes[bank.tail] = value;
        bank.tail += 1;
        Ok(())
    }

    /// Host side: drains the bank once the CPU has released it.
    pub fn host_read(&mut self) -> Result<Vec<u8>, FifoError> {
        if !self.enabled() {
            return Err(FifoError::Disabled);
        }
        if self.ueintx.intersects(Ueintx::TXINI | Ueintx::RXSTPI) {
            return Err(FifoError::Busy);
        }
        if self.ueintx.contains(Ueintx::FIFOCON) && self.ep_type() != 0 {
            return Err(FifoError::Busy);
        }
        let bank = &mut self.banks[self.current_bank];
        let data = bank.bytes[..bank.tail].to_vec();
        bank.tail = 0;
        Ok(data)
    }

    /// Host side: fills the bank once the CPU has consumed the previous
    /// packet. Returns how many bytes were accepted.
    pub fn host_write(&mut self, data: &[u8]) -> Result<usize, FifoError> {
        if !self.enabled() {
            return Err(FifoError::Disabled);
        }
        if self.ueintx.intersects(Ueintx::RXOUTI | Ueintx::RXSTPI) {
            return Err(FifoError::Busy);
        }
        if self.ueintx.contains(Ueintx::FIFOCON) && self.ep_type() != 0 {
            return Err(FifoError::Busy);
        }
        self.fill(data)
    }

    /// Host side: SETUP packets always land, a pending OUT packet is dropped.
    pub fn host_setup(&mut self, packet: &[u8; 8]) -> Result<(), FifoError> {
        if !self.enabled() {
            return Err(FifoError::Disabled);
        }
        self.ueconx &= !STALLRQ;
        self.ueintx.remove(Ueintx::RXOUTI);
        self.setup_is_read = packet[0] & 0x80 != 0;
        self.fill(packet).map(|_| ())
    }

    fn fill(&mut self, data: &[u8]) -> Result<usize, FifoError> {
        let len = data.len().min(self.fifo_size());
        let bank = &mut self.banks[self.current_bank];
        bank.bytes[..len].copy_from_slice(&data[..len]);
        bank.tail = len;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_out() -> Endpoint {
        let mut ep = Endpoint::default();
        ep.write_ueconx(EPEN);
        ep.write_uecfg0x(0x80);
        // 32 bytes, ALLOC
        ep.write_uecfg1x(0x22);
        ep
    }

    #[test]
    fn test_fifo_size_from_epsize() {
        let ep = bulk_out();
        assert_eq!(ep.fifo_size(), 32);
        assert_ne!(ep.uesta0x & CFGOK, 0);
    }

    #[test]
    fn test_cpu_fifo_order_and_underflow() {
        let mut ep = bulk_out();
        assert_eq!(ep.host_write(&[1, 2, 3]), Ok(3));
        assert_eq!(ep.cpu_read_byte(), Ok(1));
        assert_eq!(ep.cpu_read_byte(), Ok(2));
        assert_eq!(ep.cpu_read_byte(), Ok(3));
        assert_eq!(ep.cpu_read_byte(), Err(FifoError::Empty));
    }

    #[test]
    fn test_host_write_busy_until_rxouti_cleared() {
        let mut ep = bulk_out();
        ep.host_write(&[0xAA]).unwrap();
        ep.latch(EpEvent::RxOut);
        assert_eq!(ep.host_write(&[0xBB]), Err(FifoError::Busy));
        ep.write_ueintx(Ueintx::RXOUTI.bits(), ClearPolarity::WriteOneToClear);
        assert_eq!(ep.host_write(&[0xBB]), Ok(1));
    }

    #[test]
    fn test_clear_polarity() {
        let mut ep = bulk_out();
        ep.latch(EpEvent::RxOut);
        ep.latch(EpEvent::NakIn);
        // writing zeros clears nothing with write-one-to-clear
        ep.write_ueintx(0x00, ClearPolarity::WriteOneToClear);
        assert!(ep.ueintx.contains(Ueintx::RXOUTI | Ueintx::NAKINI));
        ep.write_ueintx(!Ueintx::NAKINI.bits(), ClearPolarity::WriteZeroToClear);
        assert!(ep.ueintx.contains(Ueintx::RXOUTI));
        assert!(!ep.ueintx.contains(Ueintx::NAKINI));
    }

    #[test]
    fn test_setup_ack_primes_txini() {
        let mut ep = Endpoint::default();
        ep.write_ueconx(EPEN);
        ep.write_uecfg1x(0x32);
        ep.ueintx = Ueintx::empty();
        ep.host_setup(&[0x00, 0x09, 1, 0, 0, 0, 0, 0]).unwrap();
        ep.latch(EpEvent::RxSetup);
        // control write: stray clears are ignored until RXSTPI is acknowledged
        ep.ueintx.insert(Ueintx::NAKOUTI);
        ep.write_ueintx(Ueintx::TXINI.bits(), ClearPolarity::WriteOneToClear);
        assert!(ep.ueintx.contains(Ueintx::RXSTPI));
        ep.write_ueintx(Ueintx::RXSTPI.bits(), ClearPolarity::WriteOneToClear);
        assert!(ep.ueintx.contains(Ueintx::TXINI));
        assert!(!ep.ueintx.contains(Ueintx::RXSTPI));
    }

    #[test]
    fn test_uesta0x_flags_clear_only() {
        let mut ep = bulk_out();
        ep.latch(EpEvent::Overflow);
        ep.write_uesta0x(0xFF);
        assert_ne!(ep.uesta0x & OVERFI, 0);
        ep.write_uesta0x(0x00);
        assert_eq!(ep.uesta0x & OVERFI, 0);
        assert_ne!(ep.uesta0x & CFGOK, 0);
    }
}
