// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Host side of the USB bridge.
//!
//! [`UsbHost`] is meant to be driven from a thread other than the simulation
//! thread. Each call blocks until the guest firmware has made the endpoint
//! ready, or until the endpoint's timeout passes.

use super::endpoint::Ueintx;
use super::{DeviceEvent, EpEvent, FifoError, UsbShared, UsbState, NUM_ENDPOINTS};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Outcome of one host transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// IN transfer completed with this payload (possibly empty).
    Data(Vec<u8>),
    /// OUT or SETUP transfer accepted.
    Done,
    /// The device did not become ready in time.
    Nak,
    /// The endpoint is halted.
    Stall,
}

impl TransferStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Data(_) | Self::Done)
    }
}

#[derive(Debug, Clone)]
pub struct UsbHost {
    shared: Arc<UsbShared>,
    control_timeout: Duration,
    transfer_timeout: Duration,
}

impl UsbHost {
    pub(crate) fn new(
        shared: Arc<UsbShared>,
        control_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            control_timeout,
            transfer_timeout,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.shared.lock().attached
    }

    /// Blocks until the firmware attaches to the bus.
    pub fn wait_attached(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while !state.attached {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            state = self.wait(state, remaining);
        }
        true
    }

    fn timeout_for(&self, ep: usize) -> Duration {
        if ep == 0 {
            self.control_timeout
        } else {
            self.transfer_timeout
        }
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, UsbState>,
        timeout: Duration,
    ) -> MutexGuard<'a, UsbState> {
        match self.shared.cpu_action.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Flags an endpoint condition for the guest and queues its interrupt.
    fn latch(state: &mut UsbState, ep: usize, event: EpEvent) {
        if state.raise_ep(ep, event) {
            state.pending_com = true;
        }
    }

    /// Runs `attempt` until it stops reporting [`FifoError::Busy`] or the
    /// endpoint's timeout passes. A halted endpoint ends the wait with a stall.
    fn transact<T>(
        &self,
        ep: usize,
        mut attempt: impl FnMut(&mut UsbState) -> Result<T, FifoError>,
    ) -> Result<T, TransferStatus> {
        if ep >= NUM_ENDPOINTS {
            warn!(ep, "transfer to a missing endpoint");
            return Err(TransferStatus::Stall);
        }
        let deadline = Instant::now() + self.timeout_for(ep);
        let mut state = self.shared.lock();
        loop {
            if state.endpoints[ep].stalled() {
                Self::latch(&mut *state, ep, EpEvent::Stalled);
                return Err(TransferStatus::Stall);
            }
            match attempt(&mut *state) {
                Ok(v) => return Ok(v),
                Err(FifoError::Busy) | Err(FifoError::Disabled) => {}
                Err(err) => {
                    trace!(ep, ?err, "transfer refused");
                    return Err(TransferStatus::Nak);
                }
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                trace!(ep, "transfer timed out");
                return Err(TransferStatus::Nak);
            };
            state = self.wait(state, remaining);
        }
    }

    /// FIFO size of an enabled endpoint.
    pub fn max_packet_size(&self, ep: usize) -> Option<usize> {
        let state = self.shared.lock();
        state
            .endpoints
            .get(ep)
            .filter(|e| e.enabled())
            .map(|e| e.fifo_size())
    }

    /// IN transfer: one packet from the endpoint FIFO.
    pub fn read(&self, ep: usize) -> TransferStatus {
        let result = self.transact(ep, |state| {
            let data = state.endpoints[ep].host_read()?;
            let endpoint = &mut state.endpoints[ep];
            if endpoint.ep_type() != 0 {
                endpoint.ueintx.insert(Ueintx::FIFOCON);
            }
            Self::latch(state, ep, EpEvent::TxIn);
            Ok(data)
        });
        match result {
            Ok(data) => {
                trace!(ep, len = data.len(), "IN packet");
                TransferStatus::Data(data)
            }
            Err(status) => status,
        }
    }

    /// OUT transfer, split into FIFO-sized packets. An empty payload sends
    /// one zero-length packet.
    pub fn write(&self, ep: usize, data: &[u8]) -> TransferStatus {
        let mut offset = 0;
        loop {
            let result = self.transact(ep, |state| {
                let size = state.endpoints[ep].fifo_size();
                let end = (offset + size).min(data.len());
                let accepted = state.endpoints[ep].host_write(&data[offset..end])?;
                let endpoint = &mut state.endpoints[ep];
                if endpoint.ep_type() != 0 {
                    endpoint.ueintx.insert(Ueintx::FIFOCON);
                }
                Self::latch(state, ep, EpEvent::RxOut);
                Ok(accepted)
            });
            match result {
                Ok(accepted) => {
                    trace!(ep, len = accepted, "OUT packet");
                    offset += accepted;
                    if offset >= data.len() || accepted == 0 {
                        return TransferStatus::Done;
                    }
                }
                Err(status) => return status,
            }
        }
    }

    /// SETUP packet. It never waits: a configured control endpoint always
    /// accepts it.
    pub fn setup(&self, ep: usize, packet: &[u8; 8]) -> TransferStatus {
        if ep >= NUM_ENDPOINTS {
            return TransferStatus::Stall;
        }
        let mut state = self.shared.lock();
        match state.endpoints[ep].host_setup(packet) {
            Ok(()) => {
                Self::latch(&mut *state, ep, EpEvent::RxSetup);
                trace!(ep, ?packet, "SETUP");
                TransferStatus::Done
            }
            Err(err) => {
                debug!(ep, ?err, "SETUP to unconfigured endpoint");
                TransferStatus::Nak
            }
        }
    }

    /// Bus reset as seen by the device.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        state.bus_reset();
        if state.raise_device(DeviceEvent::EndOfReset) {
            state.pending_gen = true;
        }
        state.restart_sof = true;
        debug!("bus reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::atmega32u4;
    use crate::usb::{endpoint, reg, UsbController};
    use crate::{PeripheralId, SimulationConfig, System};
    use std::thread;

    const USBCON: u16 = 0xD8;
    const UDCON: u16 = USBCON + reg::UDCON;
    const UDINT: u16 = USBCON + reg::UDINT;
    const UDIEN: u16 = USBCON + reg::UDIEN;
    const UENUM: u16 = USBCON + reg::UENUM;
    const UEINTX: u16 = USBCON + reg::UEINTX;
    const UECONX: u16 = USBCON + reg::UECONX;
    const UECFG0X: u16 = USBCON + reg::UECFG0X;
    const UECFG1X: u16 = USBCON + reg::UECFG1X;
    const UEDATX: u16 = USBCON + reg::UEDATX;
    const UEBCLX: u16 = USBCON + reg::UEBCLX;

    fn setup(timeout_ms: u64) -> (System, PeripheralId, UsbHost) {
        let config = SimulationConfig {
            frequency_hz: 1_000_000,
            usb_control_timeout_ms: timeout_ms,
            usb_transfer_timeout_ms: timeout_ms,
            ..SimulationConfig::default()
        };
        let mut sys = System::new(config, atmega32u4::IO_SIZE);
        let usb = UsbController::attach(&mut sys, "usb", atmega32u4::USB);
        let host = sys.get::<UsbController>(usb).unwrap().host(&sys);
        (sys, usb, host)
    }

    fn configure(sys: &mut System, ep: u8, cfg0: u8, cfg1: u8) {
        sys.write(UENUM, ep);
        sys.write(UECONX, endpoint::EPEN);
        sys.write(UECFG0X, cfg0);
        sys.write(UECFG1X, cfg1);
    }

    #[test]
    fn test_setup_to_unconfigured_endpoint_naks() {
        let (_sys, _, host) = setup(10);
        assert_eq!(host.setup(0, &[0x80, 6, 0, 1, 0, 0, 18, 0]), TransferStatus::Nak);
    }

    #[test]
    fn test_write_times_out_when_guest_never_drains() {
        let (mut sys, _, host) = setup(20);
        // bulk OUT, 8 bytes
        configure(&mut sys, 1, 0x80, 0x02);
        assert_eq!(host.write(1, &[1]), TransferStatus::Done);
        assert_eq!(host.write(1, &[2]), TransferStatus::Nak);
    }

    #[test]
    fn test_stalled_endpoint_reports_stall() {
        let (mut sys, _, host) = setup(20);
        configure(&mut sys, 2, 0x81, 0x02);
        sys.write(UECONX, endpoint::EPEN | endpoint::STALLRQ);
        assert_eq!(host.read(2), TransferStatus::Stall);
        assert_ne!(sys.read(UEINTX) & Ueintx::STALLEDI.bits(), 0);
    }

    #[test]
    fn test_reset_keeps_control_endpoint_config() {
        let (mut sys, _, host) = setup(20);
        sys.write(USBCON, 0x80);
        sys.write(UDIEN, 1 << DeviceEvent::EndOfReset as u8);
        configure(&mut sys, 0, 0x00, 0x32);
        configure(&mut sys, 1, 0x80, 0x02);
        host.reset();

        sys.write(UENUM, 1);
        assert_eq!(sys.read(UECONX) & endpoint::EPEN, 0);
        sys.write(UENUM, 0);
        assert_ne!(sys.read(UECONX) & endpoint::EPEN, 0);
        assert_eq!(sys.read(UECFG1X), 0x32);

        // the interrupt is delivered on the simulation thread
        for _ in 0..20 {
            sys.advance(1);
            sys.service();
        }
        assert_ne!(sys.read(UDINT) & 0x08, 0);
        assert!(sys.interrupts().is_pending(atmega32u4::USB.gen_vector));
    }

    #[test]
    fn test_threaded_out_transfer() {
        let (mut sys, _, host) = setup(5000);
        configure(&mut sys, 1, 0x80, 0x12);
        sys.write(UDCON, 0);

        let payload: Vec<u8> = (0..40).collect();
        let expected = payload.clone();
        let worker = thread::spawn(move || host.write(1, &payload));

        let mut received = Vec::new();
        for _ in 0..5000 {
            sys.write(UENUM, 1);
            if sys.read(UEINTX) & Ueintx::RXOUTI.bits() != 0 {
                let count = sys.read(UEBCLX);
                for _ in 0..count {
                    received.push(sys.read(UEDATX));
                }
                // release the bank: RXOUTI then FIFOCON
                sys.write(UEINTX, Ueintx::RXOUTI.bits());
                sys.write(UEINTX, Ueintx::FIFOCON.bits());
            }
            if received.len() >= expected.len() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(worker.join().unwrap(), TransferStatus::Done);
        assert_eq!(received, expected);
    }

    #[test]
    fn test_threaded_control_read() {
        let (mut sys, _, host) = setup(5000);
        configure(&mut sys, 0, 0x00, 0x32);
        sys.write(UDCON, 0);

        let worker = thread::spawn(move || {
            assert_eq!(host.setup(0, &[0x80, 6, 0, 1, 0, 0, 4, 0]), TransferStatus::Done);
            let data = host.read(0);
            let status = host.write(0, &[]);
            (data, status)
        });

        let mut answered = false;
        for _ in 0..5000 {
            sys.write(UENUM, 0);
            let flags = sys.read(UEINTX);
            if !answered && flags & Ueintx::RXSTPI.bits() != 0 {
                let setup: Vec<u8> = (0..8).map(|_| sys.read(UEDATX)).collect();
                assert_eq!(setup[1], 6);
                sys.write(UEINTX, Ueintx::RXSTPI.bits());
                for b in [0x12, 0x01, 0x00, 0x02] {
                    sys.write(UEDATX, b);
                }
                sys.write(UEINTX, Ueintx::TXINI.bits());
                answered = true;
            }
            if answered && flags & Ueintx::RXOUTI.bits() != 0 {
                sys.write(UEINTX, Ueintx::RXOUTI.bits());
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let (data, status) = worker.join().unwrap();
        assert_eq!(data, TransferStatus::Data(vec![0x12, 0x01, 0x00, 0x02]));
        assert_eq!(status, TransferStatus::Done);
    }
}
