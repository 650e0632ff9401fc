//! In-process EC simulator.
//!
//! Implements [`PortBus`] over the same 13-register window protocol the
//! real controller speaks: address-indexed data lanes, doorbell handshake,
//! framed requests with whole-frame checksums. Command semantics come from
//! a pluggable [`Firmware`] handler, so tests and hardware-less hosts can
//! script exactly the behaviour they need, including deferred completion
//! and fault injection.

use std::sync::{Arc, Mutex};

use super::port::{PortBus, PortError};
use super::status::EcStatus;
use super::wire::{self, EMI_MAX_FRAME, HEADER_LEN, PROTOCOL_VERSION};

/// Command handler: takes the command id and request data, returns the
/// result status and response data.
type Handler = dyn FnMut(u16, &[u8]) -> (EcStatus, Vec<u8>) + Send;

/// Scripted firmware behaviour for the simulator.
pub struct Firmware {
    handler: Box<Handler>,
    /// Corrupt the checksum of every response frame.
    corrupt_checksum: bool,
    /// Emit a bogus protocol version in every response header.
    bad_version: bool,
    /// Never raise the response-ready doorbell.
    never_ready: bool,
}

impl Firmware {
    /// Firmware from a scripted handler.
    #[must_use]
    pub fn scripted(
        handler: impl FnMut(u16, &[u8]) -> (EcStatus, Vec<u8>) + Send + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            corrupt_checksum: false,
            bad_version: false,
            never_ready: false,
        }
    }

    /// Firmware that answers every command with its own request data.
    #[must_use]
    pub fn echo() -> Self {
        Self::scripted(|_command, payload| (EcStatus::Success, payload.to_vec()))
    }

    /// Firmware that never raises the response doorbell.
    #[must_use]
    pub fn never_ready() -> Self {
        let mut fw = Self::echo();
        fw.never_ready = true;
        fw
    }

    /// Firmware that emits an unsupported protocol version.
    #[must_use]
    pub fn bad_version() -> Self {
        let mut fw = Self::echo();
        fw.bad_version = true;
        fw
    }

    /// Firmware that corrupts every response checksum.
    #[must_use]
    pub fn corrupt_checksum() -> Self {
        let mut fw = Self::echo();
        fw.corrupt_checksum = true;
        fw
    }

    /// Firmware backed by a 256-byte ACPI namespace-0 register file.
    ///
    /// Serves `ACPI0_READ` from the shared register array and answers
    /// everything else with `InvalidCommand`. The returned handle lets a
    /// test flip registers while the poller is running.
    #[must_use]
    pub fn acpi_registers() -> (Self, Arc<Mutex<[u8; 256]>>) {
        let registers = Arc::new(Mutex::new([0u8; 256]));
        let shared = Arc::clone(&registers);
        let fw = Self::scripted(move |command, payload| {
            if command != wire::cmd::ACPI0_READ {
                return (EcStatus::InvalidCommand, Vec::new());
            }
            if payload.len() < wire::MemRegionRead::LEN {
                return (EcStatus::RequestTruncated, Vec::new());
            }
            let start = u32::from_le_bytes(payload[..4].try_into().unwrap_or([0; 4])) as usize;
            let size = u32::from_le_bytes(payload[4..8].try_into().unwrap_or([0; 4])) as usize;
            let regs = shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match regs.get(start..start.saturating_add(size)) {
                Some(slice) => (EcStatus::Success, slice.to_vec()),
                None => (EcStatus::InvalidParam, Vec::new()),
            }
        });
        (fw, registers)
    }
}

struct SimState {
    window: [u8; EMI_MAX_FRAME],
    addr: u16,
    /// HOST→EC doorbell. Zero means the window is free.
    host_ec: u8,
    /// EC→HOST doorbell. One means a response is ready.
    ec_host: u8,
    firmware: Firmware,
}

/// The simulated controller.
pub struct SimulatedEc {
    base: u16,
    state: Mutex<SimState>,
}

impl SimulatedEc {
    /// Creates a simulator with its window at `base`.
    #[must_use]
    pub fn new(base: u16, firmware: Firmware) -> Arc<Self> {
        Arc::new(Self {
            base,
            state: Mutex::new(SimState {
                window: [0u8; EMI_MAX_FRAME],
                addr: 0,
                host_ec: 0,
                ec_host: 0,
                firmware,
            }),
        })
    }

    /// Forces the HOST→EC doorbell busy so `wait bus ready` fails.
    pub fn hold_bus_busy(&self) {
        let mut state = self.lock();
        state.host_ec = 0xEE;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Processes the request frame currently in the window and loads the
    /// response frame back into it.
    fn process(state: &mut SimState) {
        let header_bytes: [u8; HEADER_LEN] = state.window[..HEADER_LEN]
            .try_into()
            .unwrap_or([0; HEADER_LEN]);
        // Request header layout: version, checksum, cmd_id, cmd_ver,
        // reserved, data_len.
        let command = u16::from_le_bytes([header_bytes[2], header_bytes[3]]);
        let data_len = usize::from(u16::from_le_bytes([header_bytes[6], header_bytes[7]]));

        let (status, data) = if header_bytes[0] != PROTOCOL_VERSION {
            (EcStatus::InvalidHeaderVersion, Vec::new())
        } else if HEADER_LEN + data_len > EMI_MAX_FRAME {
            (EcStatus::RequestTruncated, Vec::new())
        } else {
            let frame = &state.window[..HEADER_LEN + data_len];
            if wire::frame_checksum(frame) != 0 {
                (EcStatus::InvalidChecksum, Vec::new())
            } else {
                let payload = frame[HEADER_LEN..].to_vec();
                (state.firmware.handler)(command, &payload)
            }
        };

        let data = if HEADER_LEN + data.len() > EMI_MAX_FRAME {
            Vec::new()
        } else {
            data
        };

        // Build the response frame with a checksum that zeroes the sum.
        let version = if state.firmware.bad_version {
            PROTOCOL_VERSION + 1
        } else {
            PROTOCOL_VERSION
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
        frame.push(version);
        frame.push(0);
        frame.extend_from_slice(&status.to_wire().to_le_bytes());
        #[allow(clippy::cast_possible_truncation)] // bounded above
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&data);
        frame[1] = 0u8.wrapping_sub(wire::frame_checksum(&frame));
        if state.firmware.corrupt_checksum {
            frame[1] = frame[1].wrapping_add(1);
        }

        state.window[..frame.len()].copy_from_slice(&frame);

        state.host_ec = 0;
        if !state.firmware.never_ready {
            state.ec_host = 1;
        }
    }
}

impl PortBus for SimulatedEc {
    fn read(&self, port: u16) -> Result<u8, PortError> {
        let state = self.lock();
        let offset = port.wrapping_sub(self.base);
        Ok(match offset {
            0 => state.host_ec,
            1 => state.ec_host,
            2 => (state.addr & 0xFF) as u8,
            3 => (state.addr >> 8) as u8,
            4..=7 => {
                let index = usize::from(state.addr) + usize::from(offset - 4);
                state.window.get(index).copied().unwrap_or(0)
            }
            _ => 0,
        })
    }

    fn write(&self, port: u16, value: u8) -> Result<(), PortError> {
        let mut state = self.lock();
        let offset = port.wrapping_sub(self.base);
        match offset {
            0 => {
                state.host_ec = value;
                if value == 0x01 {
                    Self::process(&mut state);
                }
            }
            1 => {
                // Write one to clear the response-ready latch.
                if value == 1 {
                    state.ec_host = 0;
                }
            }
            2 => state.addr = (state.addr & 0xFF00) | u16::from(value),
            3 => state.addr = (state.addr & 0x00FF) | (u16::from(value) << 8),
            4..=7 => {
                let index = usize::from(state.addr) + usize::from(offset - 4);
                if let Some(slot) = state.window.get_mut(index) {
                    *slot = value;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::wire::EcResponseHeader;

    const BASE: u16 = 0x220;

    #[test]
    fn lanes_address_the_window() {
        let ec = SimulatedEc::new(BASE, Firmware::echo());
        ec.write(BASE + 2, 4).unwrap();
        ec.write(BASE + 3, 0).unwrap();
        ec.write(BASE + 4, 0xAA).unwrap();
        ec.write(BASE + 5, 0xBB).unwrap();

        ec.write(BASE + 2, 4).unwrap();
        assert_eq!(ec.read(BASE + 4).unwrap(), 0xAA);
        assert_eq!(ec.read(BASE + 5).unwrap(), 0xBB);
    }

    #[test]
    fn bad_request_checksum_is_rejected() {
        let ec = SimulatedEc::new(BASE, Firmware::echo());
        // Valid empty frame for GET_STATUS, then flip a byte.
        let mut frame = wire::build_request(wire::cmd::GET_STATUS, &[]).unwrap();
        frame[2] ^= 0xFF;
        for (i, byte) in frame.iter().enumerate() {
            if i % 4 == 0 {
                #[allow(clippy::cast_possible_truncation)]
                ec.write(BASE + 2, i as u8).unwrap();
                ec.write(BASE + 3, 0).unwrap();
            }
            ec.write(BASE + 4 + (i % 4) as u16, *byte).unwrap();
        }
        ec.write(BASE + 1, 1).unwrap();
        ec.write(BASE, 1).unwrap();

        assert_eq!(ec.read(BASE + 1).unwrap(), 1);
        // Response header carries InvalidChecksum in its result field.
        ec.write(BASE + 2, 0).unwrap();
        ec.write(BASE + 3, 0).unwrap();
        let b0 = ec.read(BASE + 4).unwrap();
        let b1 = ec.read(BASE + 5).unwrap();
        let b2 = ec.read(BASE + 6).unwrap();
        let b3 = ec.read(BASE + 7).unwrap();
        let header = EcResponseHeader::parse(&[b0, b1, b2, b3, 0, 0, 0, 0]);
        assert_eq!(header.status(), EcStatus::InvalidChecksum);
    }
}
