//! EC host-command frame model.
//!
//! Everything here is part of the firmware contract: the 8-byte request
//! and response headers, the whole-frame checksum, the command catalog,
//! and the typed payload records the manager's convenience calls use.
//! All multi-byte fields are little-endian.

use super::status::EcStatus;

/// Maximum size of one frame (header plus data) through the EMI window.
pub const EMI_MAX_FRAME: usize = 256;

/// Size of both the request and the response header.
pub const HEADER_LEN: usize = 8;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 3;

/// Command version carried in every request header.
pub const COMMAND_VERSION: u8 = 1;

/// EC command ids.
///
/// Must match the firmware's values.
pub mod cmd {
    /// Get the status of the port.
    pub const GET_STATUS: u16 = 0x0000;
    /// Fetch the result of a command the EC deferred to its own worker.
    pub const GET_RESULT: u16 = 0x0001;
    /// Reset the port from lockups.
    pub const RESET: u16 = 0x0002;
    /// Read EC RAM.
    pub const ECRAM_READ: u16 = 0x0013;
    /// Read a PECI package register.
    pub const PECI_RD_PKG: u16 = 0x0071;
    /// Write a PECI package register.
    pub const PECI_WR_PKG: u16 = 0x0072;
    /// Tunnel one SMBus transaction.
    pub const SMBUS_PROC: u16 = 0x0081;
    /// Read the ACPI namespace 0 window.
    pub const ACPI0_READ: u16 = 0x0091;
    /// Write the ACPI namespace 0 window.
    pub const ACPI0_WRITE: u16 = 0x0092;
    /// Read the ACPI namespace 1 window.
    pub const ACPI1_READ: u16 = 0x00A1;
    /// Write the ACPI namespace 1 window.
    pub const ACPI1_WRITE: u16 = 0x00A2;
    /// Firmware image slot layout.
    pub const DFU_INFO: u16 = 0x00D0;
    /// Run a console command on the EC shell.
    pub const SHELL_CMD: u16 = 0x00E0;
    /// Battery health record.
    pub const BAT_GET_HEALTH: u16 = 0x0102;
}

/// Parsed response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcResponseHeader {
    /// Protocol version; anything but [`PROTOCOL_VERSION`] is rejected.
    pub protocol_version: u8,
    /// Whole-frame checksum byte.
    pub checksum: u8,
    /// Command result, see [`EcStatus::from_wire`].
    pub result: u16,
    /// Bytes of data following the header.
    pub data_length: u16,
    /// Reserved, zero on current firmware.
    pub reserved: u16,
}

impl EcResponseHeader {
    /// Parses the fixed 8-byte response header.
    #[must_use]
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            protocol_version: bytes[0],
            checksum: bytes[1],
            result: u16::from_le_bytes([bytes[2], bytes[3]]),
            data_length: u16::from_le_bytes([bytes[4], bytes[5]]),
            reserved: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// The status carried in the `result` field.
    #[must_use]
    pub fn status(&self) -> EcStatus {
        EcStatus::from_wire(self.result)
    }
}

/// Builds a complete request frame: header, payload, fixed-up checksum.
///
/// The checksum byte is the two's complement of the byte sum of the rest
/// of the frame, so the unsigned sum of the whole frame is zero mod 256.
///
/// # Errors
///
/// Returns [`EcStatus::InvalidParam`] when header plus payload exceeds
/// [`EMI_MAX_FRAME`].
pub fn build_request(command: u16, payload: &[u8]) -> Result<Vec<u8>, EcStatus> {
    if HEADER_LEN + payload.len() > EMI_MAX_FRAME {
        return Err(EcStatus::InvalidParam);
    }

    #[allow(clippy::cast_possible_truncation)] // bounded by EMI_MAX_FRAME above
    let data_len = payload.len() as u16;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(PROTOCOL_VERSION);
    frame.push(0); // checksum, fixed up below
    frame.extend_from_slice(&command.to_le_bytes());
    frame.push(COMMAND_VERSION);
    frame.push(0); // reserved
    frame.extend_from_slice(&data_len.to_le_bytes());
    frame.extend_from_slice(payload);

    let sum = frame.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    frame[1] = 0u8.wrapping_sub(sum);

    Ok(frame)
}

/// Byte sum of a frame mod 256; zero for an intact frame.
#[must_use]
pub fn frame_checksum(frame: &[u8]) -> u8 {
    frame.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Request payload for the ACPI/EC-RAM read commands.
#[derive(Debug, Clone, Copy)]
pub struct MemRegionRead {
    /// Byte offset into the region.
    pub start: u32,
    /// Bytes to read.
    pub size: u32,
}

impl MemRegionRead {
    /// Encoded length.
    pub const LEN: usize = 8;

    /// Little-endian wire encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(&self.start.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Builds the payload for the ACPI write commands: region header plus data.
#[must_use]
pub fn encode_mem_region_write(start: u32, data: &[u8]) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation)] // transport bounds the frame
    let size = data.len() as u32;
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&start.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Request payload for `PECI_RD_PKG`.
#[derive(Debug, Clone, Copy)]
pub struct PeciReadPackage {
    /// PECI host id.
    pub host_id: u8,
    /// Package register index.
    pub index: u8,
    /// Low parameter byte.
    pub param_low: u8,
    /// High parameter byte.
    pub param_high: u8,
}

impl PeciReadPackage {
    /// Little-endian wire encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; 4] {
        [self.host_id, self.index, self.param_low, self.param_high]
    }

    /// Decodes the 4-byte response word.
    #[must_use]
    pub fn decode_response(data: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

/// Request payload for `PECI_WR_PKG`.
#[derive(Debug, Clone, Copy)]
pub struct PeciWritePackage {
    /// PECI host id.
    pub host_id: u8,
    /// Package register index.
    pub index: u8,
    /// Low parameter byte.
    pub param_low: u8,
    /// High parameter byte.
    pub param_high: u8,
    /// Value to write.
    pub data: u32,
}

impl PeciWritePackage {
    /// Little-endian wire encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.host_id;
        out[1] = self.index;
        out[2] = self.param_low;
        out[3] = self.param_high;
        out[4..].copy_from_slice(&self.data.to_le_bytes());
        out
    }
}

/// Maximum data bytes in one SMBus transaction.
pub const SMBUS_DATA_MAX: usize = 32;

/// One SMBus transaction tunnelled through the EC.
#[derive(Debug, Clone, Copy)]
pub struct SmbusCommand {
    /// Bus select (0=DSW, 1=A1, 2=DOCK, 3=S1, 4=RES).
    pub bus: u8,
    /// ACPI-defined SMBus protocol number.
    pub protocol: u8,
    /// Device address.
    pub address: u8,
    /// Command byte.
    pub command: u8,
    /// Valid bytes in `data`.
    pub count: u8,
    /// Transaction data.
    pub data: [u8; SMBUS_DATA_MAX],
}

impl SmbusCommand {
    /// Encoded length.
    pub const LEN: usize = 5 + SMBUS_DATA_MAX;

    /// Builds a command, truncating `data` at [`SMBUS_DATA_MAX`] bytes.
    #[must_use]
    pub fn new(bus: u8, protocol: u8, address: u8, command: u8, data: &[u8]) -> Self {
        let count = data.len().min(SMBUS_DATA_MAX);
        let mut buf = [0u8; SMBUS_DATA_MAX];
        buf[..count].copy_from_slice(&data[..count]);
        #[allow(clippy::cast_possible_truncation)] // count <= 32
        Self {
            bus,
            protocol,
            address,
            command,
            count: count as u8,
            data: buf,
        }
    }

    /// Wire encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.bus;
        out[1] = self.protocol;
        out[2] = self.address;
        out[3] = self.command;
        out[4] = self.count;
        out[5..].copy_from_slice(&self.data);
        out
    }

    /// Decodes a response record of the same shape.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        let mut data = [0u8; SMBUS_DATA_MAX];
        data.copy_from_slice(&bytes[5..Self::LEN]);
        Some(Self {
            bus: bytes[0],
            protocol: bytes[1],
            address: bytes[2],
            command: bytes[3],
            count: bytes[4].min(SMBUS_DATA_MAX as u8),
            data,
        })
    }

    /// The valid slice of `data`.
    #[must_use]
    pub fn valid_data(&self) -> &[u8] {
        &self.data[..usize::from(self.count)]
    }
}

/// Maximum EC shell command length, excluding the size byte.
pub const SHELL_CMD_MAX: usize = 100;

/// Encodes a console command for the EC shell.
///
/// # Errors
///
/// Returns [`EcStatus::Overflow`] when the command does not fit the
/// fixed firmware buffer.
pub fn encode_shell_command(command: &str) -> Result<Vec<u8>, EcStatus> {
    let bytes = command.as_bytes();
    if bytes.len() >= SHELL_CMD_MAX {
        return Err(EcStatus::Overflow);
    }
    let mut out = vec![0u8; 1 + SHELL_CMD_MAX];
    #[allow(clippy::cast_possible_truncation)] // bounded above
    {
        out[0] = bytes.len() as u8;
    }
    out[1..=bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Firmware image slot layout, from `DFU_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DfuInfo {
    /// Number of application slots.
    pub app_slot_count: u8,
    /// Number of bootloader slots.
    pub boot_slot_count: u8,
    /// Currently running application slot.
    pub app_run_slot: u8,
    /// Currently running bootloader slot.
    pub boot_run_slot: u8,
    /// Application slot size in bytes.
    pub app_slot_size: u32,
    /// Bootloader slot size in bytes.
    pub boot_slot_size: u32,
}

impl DfuInfo {
    /// Encoded length.
    pub const LEN: usize = 12;

    /// Decodes the response record.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(Self {
            app_slot_count: bytes[0],
            boot_slot_count: bytes[1],
            app_run_slot: bytes[2],
            boot_run_slot: bytes[3],
            app_slot_size: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            boot_slot_size: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
        })
    }
}

/// Battery health record, from `BAT_GET_HEALTH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BatteryHealth {
    /// Record layout version.
    pub struct_version: u8,
    /// Overall health status byte.
    pub health_status: u8,
    /// Auxiliary status byte.
    pub status1: u8,
    /// Fault flags.
    pub faults: u8,
    /// Cell 1 voltage in millivolts.
    pub cell1_mv: u16,
    /// Cell 2 voltage in millivolts.
    pub cell2_mv: u16,
    /// Cell 3 voltage in millivolts.
    pub cell3_mv: u16,
    /// Largest cell voltage difference in millivolts.
    pub cell_diff_mv: u16,
    /// Cell 1 resistance increase, percent.
    pub ra_inc_per_1: i16,
    /// Cell 1 resistance decrease, percent.
    pub ra_dec_per_1: i16,
    /// Cell 2 resistance increase, percent.
    pub ra_inc_per_2: i16,
    /// Cell 2 resistance decrease, percent.
    pub ra_dec_per_2: i16,
    /// Cell 3 resistance increase, percent.
    pub ra_inc_per_3: i16,
    /// Cell 3 resistance decrease, percent.
    pub ra_dec_per_3: i16,
    /// Seconds spent at rest.
    pub time_rest: u32,
    /// Seconds spent outside the temperature envelope.
    pub time_temp_bad: u32,
    /// Total runtime seconds.
    pub time_run: u32,
    /// Safety alert flags.
    pub safety_alert: u32,
    /// Safety status flags.
    pub safety_status: u32,
    /// Permanent-failure alert flags.
    pub pf_alert: u32,
    /// Permanent-failure status flags.
    pub pf_status: u32,
    /// Discharge current limit.
    pub discharge_limit: u16,
    /// Charge current limit.
    pub charge_limit: u16,
    /// State of health, percent.
    pub state_of_health: u8,
}

impl BatteryHealth {
    /// Encoded length.
    pub const LEN: usize = 57;

    /// Decodes the response record.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        Some(Self {
            struct_version: bytes[0],
            health_status: bytes[1],
            status1: bytes[2],
            faults: bytes[3],
            cell1_mv: u16_at(4),
            cell2_mv: u16_at(6),
            cell3_mv: u16_at(8),
            cell_diff_mv: u16_at(10),
            ra_inc_per_1: i16_at(12),
            ra_dec_per_1: i16_at(14),
            ra_inc_per_2: i16_at(16),
            ra_dec_per_2: i16_at(18),
            ra_inc_per_3: i16_at(20),
            ra_dec_per_3: i16_at(22),
            time_rest: u32_at(24),
            time_temp_bad: u32_at(28),
            time_run: u32_at(32),
            safety_alert: u32_at(36),
            safety_status: u32_at(40),
            pf_alert: u32_at(44),
            pf_status: u32_at(48),
            discharge_limit: u16_at(52),
            charge_limit: u16_at(54),
            state_of_health: bytes[56],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_sums_to_zero() {
        let frame = build_request(cmd::ACPI0_READ, &[1, 2, 3, 4]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 4);
        assert_eq!(frame_checksum(&frame), 0);
        assert_eq!(frame[0], PROTOCOL_VERSION);
        assert_eq!(&frame[2..4], &cmd::ACPI0_READ.to_le_bytes());
        assert_eq!(&frame[6..8], &4u16.to_le_bytes());
    }

    #[test]
    fn empty_payload_frame_sums_to_zero() {
        let frame = build_request(cmd::DFU_INFO, &[]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(frame_checksum(&frame), 0);
    }

    #[test]
    fn oversized_request_is_invalid_param() {
        let payload = vec![0u8; EMI_MAX_FRAME - HEADER_LEN + 1];
        assert_eq!(
            build_request(cmd::ACPI0_WRITE, &payload),
            Err(EcStatus::InvalidParam)
        );
        // The largest payload that fits is accepted.
        let payload = vec![0u8; EMI_MAX_FRAME - HEADER_LEN];
        assert!(build_request(cmd::ACPI0_WRITE, &payload).is_ok());
    }

    #[test]
    fn response_header_parses_little_endian() {
        let header = EcResponseHeader::parse(&[3, 0xAB, 0x08, 0x00, 0x10, 0x00, 0, 0]);
        assert_eq!(header.protocol_version, 3);
        assert_eq!(header.checksum, 0xAB);
        assert_eq!(header.status(), EcStatus::InProgress);
        assert_eq!(header.data_length, 16);
    }

    #[test]
    fn mem_region_read_encoding() {
        let req = MemRegionRead { start: 0, size: 4 };
        assert_eq!(req.encode(), [0, 0, 0, 0, 4, 0, 0, 0]);
    }

    #[test]
    fn shell_command_overflow() {
        let long = "x".repeat(SHELL_CMD_MAX);
        assert_eq!(encode_shell_command(&long), Err(EcStatus::Overflow));

        let encoded = encode_shell_command("kbd backlight 50").unwrap();
        assert_eq!(encoded.len(), 1 + SHELL_CMD_MAX);
        assert_eq!(encoded[0], 16);
        assert_eq!(&encoded[1..17], b"kbd backlight 50");
    }

    #[test]
    fn smbus_round_trip() {
        let cmd = SmbusCommand::new(1, 0x09, 0x16, 0x0B, &[0xDE, 0xAD]);
        let decoded = SmbusCommand::decode(&cmd.encode()).unwrap();
        assert_eq!(decoded.count, 2);
        assert_eq!(decoded.valid_data(), &[0xDE, 0xAD]);
    }

    #[test]
    fn battery_health_decodes_tail_field() {
        let mut bytes = vec![0u8; BatteryHealth::LEN];
        bytes[0] = 1;
        bytes[4] = 0x10; // cell1 low byte
        bytes[56] = 97; // state of health
        let health = BatteryHealth::decode(&bytes).unwrap();
        assert_eq!(health.struct_version, 1);
        assert_eq!(health.cell1_mv, 0x10);
        assert_eq!(health.state_of_health, 97);

        assert!(BatteryHealth::decode(&bytes[..BatteryHealth::LEN - 1]).is_none());
    }

    #[test]
    fn dfu_info_decodes() {
        let mut bytes = vec![2u8, 1, 0, 0];
        bytes.extend_from_slice(&0x0002_0000u32.to_le_bytes());
        bytes.extend_from_slice(&0x0000_8000u32.to_le_bytes());
        let info = DfuInfo::decode(&bytes).unwrap();
        assert_eq!(info.app_slot_count, 2);
        assert_eq!(info.app_slot_size, 0x0002_0000);
        assert_eq!(info.boot_slot_size, 0x8000);
    }
}
