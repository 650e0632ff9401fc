//! One transaction over the 13-register EMI window.
//!
//! The window at the configured base holds, in order: the HOST→EC
//! doorbell, the EC→HOST doorbell, two address bytes, four data bytes, and
//! four reserved interrupt/ID registers. Frames move through the four data
//! lanes in address-indexed groups of four bytes.
//!
//! The transport is stateless and is only ever entered from the EC worker
//! thread, so it needs no synchronisation beyond what the port bus already
//! provides.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::port::{PortBus, PortError};
use super::status::EcStatus;
use super::wire::{self, EcResponseHeader, EMI_MAX_FRAME, HEADER_LEN, PROTOCOL_VERSION};

/// Register offsets within the window.
const HOST_EC: u16 = 0;
const EC_HOST: u16 = 1;
const ADDR0: u16 = 2;
const ADDR1: u16 = 3;
const DATA0: u16 = 4;

/// HOST→EC doorbell: window free for the next command.
const HOST_CMD_READY: u8 = 0x00;
/// HOST→EC doorbell: command frame is in the window, process it.
const HOST_CMD_PROCEED: u8 = 0x01;
/// EC→HOST doorbell: response frame is in the window.
const EC_RESP_READY: u8 = 0x01;

/// Outer retry attempts for one transaction.
const SEND_RETRIES: u32 = 10;

/// Default budget for the response-ready poll, per attempt.
const DEFAULT_RESPONSE_TIMEOUT_MS: i64 = 5000;

/// Effective-millisecond budget for deferred-completion polling.
const DEFERRED_BUDGET_MS: u32 = 1000;

/// Outcome of one executed transaction.
#[derive(Debug)]
pub struct Exchange {
    /// Final command status.
    pub status: EcStatus,
    /// Inbound payload, empty unless the EC returned data.
    pub data: Vec<u8>,
    /// Bytes written to the window, including headers and retries.
    pub bytes_tx: u64,
    /// Bytes read back from the window, including headers.
    pub bytes_rx: u64,
}

/// Executes single EC transactions against the register window.
pub struct EcTransport {
    bus: Arc<dyn PortBus>,
    base: u16,
    response_timeout_ms: i64,
    bus_reset_pause: Duration,
}

impl EcTransport {
    /// Creates a transport over `bus` with the window at `base`.
    #[must_use]
    pub fn new(bus: Arc<dyn PortBus>, base: u16) -> Self {
        Self {
            bus,
            base,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            bus_reset_pause: Duration::from_secs(1),
        }
    }

    /// Overrides the per-attempt response poll budget.
    ///
    /// Production keeps the firmware-agreed 5000 ms; tests shorten it.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        self.bus_reset_pause = self.bus_reset_pause.min(timeout);
        self
    }

    /// The window base this transport drives.
    #[must_use]
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Runs one complete transaction: build, send with retries, and—when
    /// the EC defers the command to its own worker—poll for the result.
    ///
    /// Port-level failures surface as [`EcStatus::BusError`]; every other
    /// outcome is the protocol status itself.
    #[must_use]
    pub fn execute(&self, command: u16, payload: &[u8]) -> Exchange {
        let mut exchange = Exchange {
            status: EcStatus::Error,
            data: Vec::new(),
            bytes_tx: 0,
            bytes_rx: 0,
        };

        let frame = match wire::build_request(command, payload) {
            Ok(frame) => frame,
            Err(status) => {
                warn!("request payload too big for command {command:#06x}");
                exchange.status = status;
                return exchange;
            }
        };

        match self.run(&frame, &mut exchange) {
            Ok(status) => exchange.status = status,
            Err(err) => {
                warn!("port bus failure on command {command:#06x}: {err}");
                exchange.status = EcStatus::BusError;
            }
        }
        exchange
    }

    fn run(&self, frame: &[u8], exchange: &mut Exchange) -> Result<EcStatus, PortError> {
        let mut status = EcStatus::Error;

        let mut retry = SEND_RETRIES;
        while retry > 0 {
            retry -= 1;
            status = self.send_once(frame, exchange)?;
            if status == EcStatus::Success || status == EcStatus::InProgress {
                break;
            }
        }

        // A final InProgress means the EC queued the command on its own
        // worker; keep asking for the result until it lands.
        if status == EcStatus::InProgress {
            warn!("slow transfer in progress");
            status = self.poll_deferred(exchange)?;
        }

        Ok(status)
    }

    /// One attempt: bus handshake, frame out, trigger, response in.
    fn send_once(&self, frame: &[u8], exchange: &mut Exchange) -> Result<EcStatus, PortError> {
        if self.wait_bus_ready()? != EcStatus::Success {
            return Ok(EcStatus::BusError);
        }

        self.write_frame(frame)?;
        exchange.bytes_tx += frame.len() as u64;

        // Clear the response-ready latch (write one to clear), then hand
        // the frame to the EC.
        self.bus.write(self.base + EC_HOST, 1)?;
        self.bus.write(self.base + HOST_EC, HOST_CMD_PROCEED)?;

        // Response poll: the first five reads are free, the next stretch
        // sleeps 1 ms per read, after that 10 ms per read.
        let mut waited_ms: i64 = -5;
        loop {
            let doorbell = self.bus.read(self.base + EC_HOST)?;
            if doorbell == EC_RESP_READY {
                break;
            }

            if waited_ms >= self.response_timeout_ms {
                warn!("response timeout, EC doorbell {doorbell:#04x}");
                self.bus.write(self.base + EC_HOST, 1)?;
                std::thread::sleep(self.bus_reset_pause);
                return Ok(EcStatus::Timeout);
            } else if waited_ms >= 10 {
                std::thread::sleep(Duration::from_millis(10));
                waited_ms += 10;
            } else if waited_ms >= 0 {
                std::thread::sleep(Duration::from_millis(1));
                waited_ms += 1;
            } else {
                waited_ms += 1;
            }
        }

        if waited_ms > 10 {
            debug!(waited_ms, "slow EC response");
        }

        self.read_frame(exchange)
    }

    /// Polls the HOST→EC doorbell until the EC reports the window free.
    fn wait_bus_ready(&self) -> Result<EcStatus, PortError> {
        let mut retry = 0u32;
        loop {
            let doorbell = self.bus.read(self.base + HOST_EC)?;
            if doorbell == HOST_CMD_READY {
                return Ok(EcStatus::Success);
            }

            // The first four checks run tight, then slow to 1 ms.
            if retry >= 4 {
                std::thread::sleep(Duration::from_millis(1));
            }
            if retry > 10 {
                warn!("bus busy, HOST doorbell {doorbell:#04x}");
                return Ok(EcStatus::BusError);
            }
            retry += 1;
        }
    }

    /// Walks the frame out through the four data lanes. The first byte of
    /// every group sets the window address; the next three ride the
    /// remaining lanes.
    fn write_frame(&self, frame: &[u8]) -> Result<(), PortError> {
        for (offset, byte) in frame.iter().enumerate() {
            let lane = (offset % 4) as u16;
            if lane == 0 {
                #[allow(clippy::cast_possible_truncation)] // frame <= EMI_MAX_FRAME
                self.bus.write(self.base + ADDR0, offset as u8)?;
                self.bus.write(self.base + ADDR1, 0)?;
            }
            self.bus.write(self.base + DATA0 + lane, *byte)?;
        }
        Ok(())
    }

    /// Reads the response header and data back through the lanes,
    /// validating version, size, and the whole-frame checksum.
    fn read_frame(&self, exchange: &mut Exchange) -> Result<EcStatus, PortError> {
        let mut packet: Vec<u8> = Vec::with_capacity(HEADER_LEN);
        let mut checksum: u8 = 0;
        let mut expected = HEADER_LEN;
        let mut header = EcResponseHeader::parse(&[0u8; HEADER_LEN]);

        let mut offset = 0usize;
        while offset < expected {
            let lane = (offset % 4) as u16;
            if lane == 0 {
                #[allow(clippy::cast_possible_truncation)] // expected <= EMI_MAX_FRAME
                self.bus.write(self.base + ADDR0, offset as u8)?;
                self.bus.write(self.base + ADDR1, 0)?;
            }
            let byte = self.bus.read(self.base + DATA0 + lane)?;
            checksum = checksum.wrapping_add(byte);
            packet.push(byte);
            offset += 1;

            // Once the header is in, the declared length bounds the rest.
            if packet.len() == HEADER_LEN {
                let mut header_bytes = [0u8; HEADER_LEN];
                header_bytes.copy_from_slice(&packet[..HEADER_LEN]);
                header = EcResponseHeader::parse(&header_bytes);

                if header.protocol_version != PROTOCOL_VERSION {
                    debug!(version = header.protocol_version, "invalid protocol version");
                    return Ok(EcStatus::InvalidVersion);
                }

                expected = HEADER_LEN + usize::from(header.data_length);
                if expected > EMI_MAX_FRAME {
                    warn!(bytes = expected, "response too large");
                    return Ok(EcStatus::ResponseTooBig);
                }
            }
        }

        exchange.bytes_rx += packet.len() as u64;

        let mut status = header.status();

        if checksum != 0 {
            warn!("response checksum error: {checksum:#04x}");
            status = EcStatus::InvalidChecksum;
        }

        exchange.data = packet.split_off(HEADER_LEN);
        Ok(status)
    }

    /// Deferred completion: the EC answered `InProgress`, so its worker is
    /// still running the command. Poll `GET_RESULT` with back-off until it
    /// produces a terminal status or the budget runs out.
    fn poll_deferred(&self, exchange: &mut Exchange) -> Result<EcStatus, PortError> {
        let frame = wire::build_request(wire::cmd::GET_RESULT, &[])
            .expect("empty GET_RESULT request always fits the window");

        let mut elapsed_ms: u32 = 0;
        while elapsed_ms < DEFERRED_BUDGET_MS {
            let status = self.send_once(&frame, exchange)?;
            if status == EcStatus::Success {
                debug!(elapsed_ms, "deferred result ready");
                return Ok(status);
            }
            if status != EcStatus::InProgress {
                warn!(%status, elapsed_ms, "deferred result failed");
                return Ok(status);
            }

            if elapsed_ms < 10 {
                elapsed_ms += 1;
            } else if elapsed_ms < 30 {
                std::thread::sleep(Duration::from_millis(1));
                elapsed_ms += 1;
            } else {
                std::thread::sleep(Duration::from_millis(20));
                elapsed_ms += 20;
            }
        }

        warn!(elapsed_ms, "deferred result timeout");
        Ok(EcStatus::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::ec::sim::{Firmware, SimulatedEc};
    use crate::ec::wire::cmd;

    const BASE: u16 = 0x220;

    fn transport(ec: &Arc<SimulatedEc>) -> EcTransport {
        EcTransport::new(Arc::clone(ec) as Arc<dyn PortBus>, BASE)
            .with_response_timeout(Duration::from_millis(200))
    }

    #[test]
    fn echo_round_trip() {
        let ec = SimulatedEc::new(BASE, Firmware::echo());
        let out = transport(&ec).execute(cmd::ACPI0_READ, &[0, 0, 0, 0, 4, 0, 0, 0]);
        assert_eq!(out.status, EcStatus::Success);
        assert_eq!(out.data, vec![0, 0, 0, 0, 4, 0, 0, 0]);
        assert!(out.bytes_tx >= 16);
        assert!(out.bytes_rx >= 16);
    }

    #[test]
    fn oversized_payload_is_rejected_before_the_bus() {
        let ec = SimulatedEc::new(BASE, Firmware::echo());
        let out = transport(&ec).execute(cmd::ACPI0_WRITE, &vec![0u8; EMI_MAX_FRAME]);
        assert_eq!(out.status, EcStatus::InvalidParam);
        assert_eq!(out.bytes_tx, 0);
    }

    #[test]
    fn busy_bus_is_a_bus_error() {
        let ec = SimulatedEc::new(BASE, Firmware::echo());
        ec.hold_bus_busy();
        let out = transport(&ec).execute(cmd::GET_STATUS, &[]);
        assert_eq!(out.status, EcStatus::BusError);
    }

    #[test]
    fn never_ready_ec_times_out() {
        let ec = SimulatedEc::new(BASE, Firmware::never_ready());
        let out = transport(&ec).execute(cmd::GET_STATUS, &[]);
        assert_eq!(out.status, EcStatus::Timeout);
    }

    #[test]
    fn wrong_protocol_version_is_rejected() {
        let ec = SimulatedEc::new(BASE, Firmware::bad_version());
        let out = transport(&ec).execute(cmd::GET_STATUS, &[]);
        assert_eq!(out.status, EcStatus::InvalidVersion);
    }

    #[test]
    fn corrupted_response_is_a_checksum_error() {
        let ec = SimulatedEc::new(BASE, Firmware::corrupt_checksum());
        let out = transport(&ec).execute(cmd::GET_STATUS, &[]);
        assert_eq!(out.status, EcStatus::InvalidChecksum);
    }

    #[test]
    fn deferred_completion_polls_get_result() {
        let polls = Arc::new(AtomicU32::new(0));
        let polls_fw = Arc::clone(&polls);
        let ec = SimulatedEc::new(
            BASE,
            Firmware::scripted(move |command, _payload| {
                if command == cmd::GET_RESULT {
                    if polls_fw.fetch_add(1, Ordering::SeqCst) < 3 {
                        (EcStatus::InProgress, Vec::new())
                    } else {
                        (EcStatus::Success, vec![0xAA])
                    }
                } else {
                    (EcStatus::InProgress, Vec::new())
                }
            }),
        );

        let out = transport(&ec).execute(cmd::SHELL_CMD, &[1, b'x']);
        assert_eq!(out.status, EcStatus::Success);
        assert_eq!(out.data, vec![0xAA]);
        assert!(polls.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_fw = Arc::clone(&calls);
        let ec = SimulatedEc::new(
            BASE,
            Firmware::scripted(move |_command, _payload| {
                if calls_fw.fetch_add(1, Ordering::SeqCst) < 2 {
                    (EcStatus::Busy, Vec::new())
                } else {
                    (EcStatus::Success, Vec::new())
                }
            }),
        );

        let out = transport(&ec).execute(cmd::GET_STATUS, &[]);
        assert_eq!(out.status, EcStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
