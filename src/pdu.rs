//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! Initiator-side view of the binary protocol format described in RFC 3720:
//! builders for the PDUs an initiator sends and parsers for the PDUs a
//! target answers with.

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Largest DataSegmentLength the 24-bit header field can carry
pub const MAX_DATA_SEGMENT_LENGTH: u32 = 0x00FF_FFFF;

/// Smallest MaxRecvDataSegmentLength RFC 3720 allows a peer to declare
pub const MIN_DATA_SEGMENT_LENGTH: u32 = 512;

/// Target Transfer Tag value meaning "no tag" (unsolicited data, NOP-Out ping)
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags (byte 1)
pub mod flags {
    pub const FINAL: u8 = 0x80;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTR_SIMPLE: u8 = 0x01;

    // Data-In flags
    pub const ACKNOWLEDGE: u8 = 0x40;
    pub const RESIDUAL_OVERFLOW: u8 = 0x04;
    pub const RESIDUAL_UNDERFLOW: u8 = 0x02;
    pub const STATUS: u8 = 0x01;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // Login stages (CSG in bits 2-3, NSG in bits 0-1)
    pub const STAGE_SECURITY_NEG: u8 = 0x00;
    pub const STAGE_LOGIN_OP_NEG: u8 = 0x01;
    pub const STAGE_FULL_FEATURE: u8 = 0x03;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;
}

/// Logout reason codes
pub mod logout_reason {
    pub const CLOSE_SESSION: u8 = 0;
    pub const CLOSE_CONNECTION: u8 = 1;
}

/// iSCSI response codes carried in a SCSI Response (byte 2)
pub mod response_code {
    pub const COMMAND_COMPLETED: u8 = 0x00;
    pub const TARGET_FAILURE: u8 = 0x01;
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPdu {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 (response/status, version fields)
    pub opcode_specific: [u8; 2],
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub ahs_length: u8,
    /// Data segment length as read from the wire (bytes)
    pub data_length: u32,
    /// Logical Unit Number or ISID/TSIH (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Data segment (variable length)
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiPdu {
    /// Create a new empty PDU
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            opcode_specific: [0u8; 2],
            ahs_length: 0,
            data_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    /// Parse a PDU from bytes
    ///
    /// The input buffer must contain at least the 48-byte BHS.
    /// If the PDU has data, the buffer must also contain the data segment.
    pub fn from_bytes(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);

        let byte0 = cursor.read_u8()?;
        let immediate = (byte0 & 0x40) != 0;
        let opcode = byte0 & 0x3F;
        let flags = cursor.read_u8()?;

        let mut opcode_specific = [0u8; 2];
        cursor.read_exact(&mut opcode_specific)?;

        let ahs_length = cursor.read_u8()?;
        let data_length = cursor.read_u24::<BigEndian>()?;
        let lun = cursor.read_u64::<BigEndian>()?;
        let itt = cursor.read_u32::<BigEndian>()?;

        let mut specific = [0u8; 28];
        cursor.read_exact(&mut specific)?;

        let ahs_bytes = (ahs_length as usize) * 4;
        let padded_data_len = (data_length as usize).div_ceil(4) * 4;
        let total_len = BHS_SIZE + ahs_bytes + padded_data_len;

        if buf.len() < total_len {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU incomplete: {} bytes, need {} (BHS={}, AHS={}, data={})",
                buf.len(),
                total_len,
                BHS_SIZE,
                ahs_bytes,
                padded_data_len
            )));
        }

        // AHS is skipped; nothing this crate receives carries one
        let data_start = BHS_SIZE + ahs_bytes;
        let data = buf[data_start..data_start + data_length as usize].to_vec();

        Ok(IscsiPdu {
            opcode,
            immediate,
            flags,
            opcode_specific,
            ahs_length,
            data_length,
            lun,
            itt,
            specific,
            data,
        })
    }

    /// Serialize PDU to bytes
    ///
    /// DataSegmentLength is always taken from `data`, never from
    /// `data_length`, so what goes on the wire matches the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ahs_bytes = (self.ahs_length as usize) * 4;
        let padded_data_len = self.data.len().div_ceil(4) * 4;
        let mut buf = vec![0u8; BHS_SIZE + ahs_bytes + padded_data_len];

        buf[0] = (if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F);
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.opcode_specific);
        buf[4] = self.ahs_length;
        BigEndian::write_u24(&mut buf[5..8], self.data.len() as u32);
        BigEndian::write_u64(&mut buf[8..16], self.lun);
        BigEndian::write_u32(&mut buf[16..20], self.itt);
        buf[20..BHS_SIZE].copy_from_slice(&self.specific);

        let data_start = BHS_SIZE + ahs_bytes;
        buf[data_start..data_start + self.data.len()].copy_from_slice(&self.data);

        buf
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    fn expect_opcode(&self, expected: u8) -> ScsiResult<()> {
        if self.opcode != expected {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected {} (0x{:02x}), got {} (0x{:02x})",
                opcode_name(expected),
                expected,
                self.opcode_name(),
                self.opcode
            )));
        }
        Ok(())
    }
}

/// Name of an opcode for logs and diagnostics
pub fn opcode_name(code: u8) -> &'static str {
    match code {
        opcode::NOP_OUT => "NOP-Out",
        opcode::SCSI_COMMAND => "SCSI Command",
        opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
        opcode::LOGIN_REQUEST => "Login Request",
        opcode::TEXT_REQUEST => "Text Request",
        opcode::SCSI_DATA_OUT => "SCSI Data-Out",
        opcode::LOGOUT_REQUEST => "Logout Request",
        opcode::SNACK_REQUEST => "SNACK Request",
        opcode::NOP_IN => "NOP-In",
        opcode::SCSI_RESPONSE => "SCSI Response",
        opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
        opcode::LOGIN_RESPONSE => "Login Response",
        opcode::TEXT_RESPONSE => "Text Response",
        opcode::SCSI_DATA_IN => "SCSI Data-In",
        opcode::LOGOUT_RESPONSE => "Logout Response",
        opcode::R2T => "Ready To Transfer",
        opcode::ASYNC_MESSAGE => "Async Message",
        opcode::REJECT => "Reject",
        _ => "Unknown",
    }
}

fn check_segment_length(data: &[u8]) -> ScsiResult<()> {
    if data.len() > MAX_DATA_SEGMENT_LENGTH as usize {
        return Err(IscsiError::InvalidPdu(format!(
            "Data segment of {} bytes does not fit the 24-bit DataSegmentLength",
            data.len()
        )));
    }
    Ok(())
}

// ============================================================================
// Login
// ============================================================================

impl IscsiPdu {
    /// Create a Login Request PDU
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: u8,
        nsg: u8,
        transit: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;

        pdu.flags = (if transit { flags::TRANSIT } else { 0 })
            | ((csg & 0x03) << 2)
            | (nsg & 0x03);

        // VersionMax / VersionMin are both 0x00
        pdu.opcode_specific = [0x00, 0x00];

        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&isid);
        lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
        pdu.lun = u64::from_be_bytes(lun_bytes);
        pdu.itt = itt;

        // Bytes 20-21: CID
        BigEndian::write_u16(&mut pdu.specific[0..2], cid);
        // Bytes 24-27: CmdSN
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        // Bytes 28-31: ExpStatSN
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);

        pdu.data_length = data.len() as u32;
        pdu.data = data;

        pdu
    }

    /// Parse a Login Response
    pub fn parse_login_response(&self) -> ScsiResult<LoginResponse> {
        self.expect_opcode(opcode::LOGIN_RESPONSE)?;

        let lun_bytes = self.lun.to_be_bytes();
        let mut isid = [0u8; 6];
        isid.copy_from_slice(&lun_bytes[0..6]);

        Ok(LoginResponse {
            isid,
            tsih: BigEndian::read_u16(&lun_bytes[6..8]),
            itt: self.itt,
            transit: (self.flags & flags::TRANSIT) != 0,
            cont: (self.flags & flags::CONTINUE_LOGIN) != 0,
            csg: (self.flags >> 2) & 0x03,
            nsg: self.flags & 0x03,
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_cmd_sn: BigEndian::read_u32(&self.specific[8..12]),
            max_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            status_class: self.specific[16],
            status_detail: self.specific[17],
            parameters: parse_text_parameters(&self.data)?,
        })
    }
}

/// Parsed Login Response
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub itt: u32,
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status_class: u8,
    pub status_detail: u8,
    pub parameters: Vec<(String, String)>,
}

// ============================================================================
// SCSI Command / Data-Out (initiator → target)
// ============================================================================

impl IscsiPdu {
    /// Create a SCSI Command PDU
    ///
    /// `immediate_data` becomes the data segment. `final_flag` must be clear
    /// when unsolicited Data-Out PDUs follow the command.
    pub fn scsi_command(
        lun: u64,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        expected_data_length: u32,
        cdb: &[u8],
        read: bool,
        write: bool,
        final_flag: bool,
        immediate_data: Vec<u8>,
    ) -> ScsiResult<Self> {
        if cdb.is_empty() || cdb.len() > 16 {
            return Err(IscsiError::InvalidPdu(format!(
                "CDB must be 1-16 bytes, got {}",
                cdb.len()
            )));
        }
        check_segment_length(&immediate_data)?;

        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_COMMAND;
        pdu.flags = flags::ATTR_SIMPLE;
        if final_flag {
            pdu.flags |= flags::FINAL;
        }
        if read {
            pdu.flags |= flags::READ;
        }
        if write {
            pdu.flags |= flags::WRITE;
        }
        pdu.lun = lun;
        pdu.itt = itt;

        // Bytes 20-23: Expected Data Transfer Length
        BigEndian::write_u32(&mut pdu.specific[0..4], expected_data_length);
        // Bytes 24-27: CmdSN
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        // Bytes 28-31: ExpStatSN
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        // Bytes 32-47: CDB
        pdu.specific[12..12 + cdb.len()].copy_from_slice(cdb);

        pdu.data_length = immediate_data.len() as u32;
        pdu.data = immediate_data;

        Ok(pdu)
    }

    /// Create a SCSI Data-Out PDU
    ///
    /// Use [`RESERVED_TAG`] as `ttt` for unsolicited data.
    pub fn scsi_data_out(
        lun: u64,
        itt: u32,
        ttt: u32,
        exp_stat_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
    ) -> ScsiResult<Self> {
        check_segment_length(&data)?;

        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_DATA_OUT;
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.lun = lun;
        pdu.itt = itt;

        // Bytes 20-23: Target Transfer Tag
        BigEndian::write_u32(&mut pdu.specific[0..4], ttt);
        // Bytes 28-31: ExpStatSN
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        // Bytes 36-39: DataSN
        BigEndian::write_u32(&mut pdu.specific[16..20], data_sn);
        // Bytes 40-43: Buffer Offset
        BigEndian::write_u32(&mut pdu.specific[20..24], buffer_offset);

        pdu.data_length = data.len() as u32;
        pdu.data = data;

        Ok(pdu)
    }

    /// Parse a SCSI Command PDU (used when checking what was sent)
    pub fn parse_scsi_command(&self) -> ScsiResult<ScsiCommandPdu> {
        self.expect_opcode(opcode::SCSI_COMMAND)?;

        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&self.specific[12..28]);

        Ok(ScsiCommandPdu {
            lun: self.lun,
            itt: self.itt,
            expected_data_length: BigEndian::read_u32(&self.specific[0..4]),
            cmd_sn: BigEndian::read_u32(&self.specific[4..8]),
            cdb,
            read: (self.flags & flags::READ) != 0,
            write: (self.flags & flags::WRITE) != 0,
            final_flag: (self.flags & flags::FINAL) != 0,
        })
    }

    /// Parse a SCSI Data-Out PDU (used when checking what was sent)
    pub fn parse_scsi_data_out(&self) -> ScsiResult<ScsiDataOutPdu> {
        self.expect_opcode(opcode::SCSI_DATA_OUT)?;

        Ok(ScsiDataOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            exp_stat_sn: BigEndian::read_u32(&self.specific[8..12]),
            data_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            data: self.data.clone(),
            final_flag: (self.flags & flags::FINAL) != 0,
        })
    }
}

/// Parsed SCSI Command
#[derive(Debug, Clone)]
pub struct ScsiCommandPdu {
    pub lun: u64,
    pub itt: u32,
    pub expected_data_length: u32,
    pub cmd_sn: u32,
    pub cdb: [u8; 16],
    pub read: bool,
    pub write: bool,
    pub final_flag: bool,
}

/// Parsed SCSI Data-Out
#[derive(Debug, Clone)]
pub struct ScsiDataOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub exp_stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub data: Vec<u8>,
    pub final_flag: bool,
}

// ============================================================================
// SCSI Response / Data-In / R2T (target → initiator)
// ============================================================================

impl IscsiPdu {
    /// Parse a SCSI Response
    ///
    /// The data segment is SenseLength (2 bytes) followed by the sense data.
    pub fn parse_scsi_response(&self) -> ScsiResult<ScsiResponsePdu> {
        self.expect_opcode(opcode::SCSI_RESPONSE)?;

        let sense = if self.data.len() >= 2 {
            let sense_len = BigEndian::read_u16(&self.data[0..2]) as usize;
            let end = (2 + sense_len).min(self.data.len());
            self.data[2..end].to_vec()
        } else {
            Vec::new()
        };

        Ok(ScsiResponsePdu {
            itt: self.itt,
            response: self.opcode_specific[0],
            status: self.opcode_specific[1],
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_cmd_sn: BigEndian::read_u32(&self.specific[8..12]),
            max_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            residual_count: BigEndian::read_u32(&self.specific[24..28]),
            underflow: (self.flags & flags::RESIDUAL_UNDERFLOW) != 0,
            overflow: (self.flags & flags::RESIDUAL_OVERFLOW) != 0,
            sense,
        })
    }

    /// Parse a SCSI Data-In
    pub fn parse_scsi_data_in(&self) -> ScsiResult<ScsiDataInPdu> {
        self.expect_opcode(opcode::SCSI_DATA_IN)?;

        let has_status = (self.flags & flags::STATUS) != 0;

        Ok(ScsiDataInPdu {
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            final_flag: (self.flags & flags::FINAL) != 0,
            status: if has_status {
                Some(self.opcode_specific[1])
            } else {
                None
            },
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_cmd_sn: BigEndian::read_u32(&self.specific[8..12]),
            max_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            data_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            residual_count: BigEndian::read_u32(&self.specific[24..28]),
            data: self.data.clone(),
        })
    }

    /// Parse a Ready To Transfer
    pub fn parse_r2t(&self) -> ScsiResult<R2tPdu> {
        self.expect_opcode(opcode::R2T)?;

        Ok(R2tPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: BigEndian::read_u32(&self.specific[0..4]),
            stat_sn: BigEndian::read_u32(&self.specific[4..8]),
            exp_cmd_sn: BigEndian::read_u32(&self.specific[8..12]),
            max_cmd_sn: BigEndian::read_u32(&self.specific[12..16]),
            r2t_sn: BigEndian::read_u32(&self.specific[16..20]),
            buffer_offset: BigEndian::read_u32(&self.specific[20..24]),
            desired_length: BigEndian::read_u32(&self.specific[24..28]),
        })
    }

    /// Reason code of a Reject PDU (byte 2)
    pub fn parse_reject_reason(&self) -> ScsiResult<u8> {
        self.expect_opcode(opcode::REJECT)?;
        Ok(self.opcode_specific[0])
    }
}

/// Parsed SCSI Response
#[derive(Debug, Clone)]
pub struct ScsiResponsePdu {
    pub itt: u32,
    pub response: u8,
    pub status: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub residual_count: u32,
    pub underflow: bool,
    pub overflow: bool,
    /// Raw sense bytes without the SenseLength prefix
    pub sense: Vec<u8>,
}

/// Parsed SCSI Data-In
#[derive(Debug, Clone)]
pub struct ScsiDataInPdu {
    pub itt: u32,
    pub ttt: u32,
    pub final_flag: bool,
    /// SCSI status when the S bit is set
    pub status: Option<u8>,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub residual_count: u32,
    pub data: Vec<u8>,
}

/// Parsed R2T
#[derive(Debug, Clone)]
pub struct R2tPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_length: u32,
}

// ============================================================================
// NOP-Out / Logout (initiator → target)
// ============================================================================

impl IscsiPdu {
    /// Create a NOP-Out answering a target ping (NOP-In with a real TTT)
    pub fn nop_out_reply(lun: u64, ttt: u32, cmd_sn: u32, exp_stat_sn: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.immediate = true;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = RESERVED_TAG;
        BigEndian::write_u32(&mut pdu.specific[0..4], ttt);
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);
        pdu
    }

    /// Create a Logout Request
    pub fn logout_request(itt: u32, reason: u8, cid: u16, cmd_sn: u32, exp_stat_sn: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_REQUEST;
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (reason & 0x7F);
        pdu.itt = itt;

        // Bytes 20-21: CID
        BigEndian::write_u16(&mut pdu.specific[0..2], cid);
        // Bytes 24-27: CmdSN
        BigEndian::write_u32(&mut pdu.specific[4..8], cmd_sn);
        // Bytes 28-31: ExpStatSN
        BigEndian::write_u32(&mut pdu.specific[8..12], exp_stat_sn);

        pdu
    }

    /// Response code of a Logout Response (byte 2)
    pub fn parse_logout_response(&self) -> ScsiResult<u8> {
        self.expect_opcode(opcode::LOGOUT_RESPONSE)?;
        Ok(self.opcode_specific[0])
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
pub fn parse_text_parameters(data: &[u8]) -> ScsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = String::from_utf8_lossy(chunk);
        match s.split_once('=') {
            Some((key, value)) => params.push((key.to_string(), value.to_string())),
            None => {
                return Err(IscsiError::Protocol(format!(
                    "Malformed text parameter: {:?}",
                    s
                )))
            }
        }
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(&str, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit Tests
// ============================================================================
