//! SCSI command building and response parsing
//!
//! CDB builders for the write-class commands whose flag bits the probes
//! exercise, plus parsers for sense data, standard INQUIRY and
//! READ CAPACITY (16) replies (SBC-3 / SPC-4).

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// SCSI command opcodes used by this crate
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    Inquiry = 0x12,
    Write10 = 0x2A,
    Write16 = 0x8A,
    WriteSame16 = 0x93,
    ServiceActionIn16 = 0x9E, // READ CAPACITY 16 uses this
    Write12 = 0xAA,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x12 => Some(ScsiOpcode::Inquiry),
            0x2A => Some(ScsiOpcode::Write10),
            0x8A => Some(ScsiOpcode::Write16),
            0x93 => Some(ScsiOpcode::WriteSame16),
            0x9E => Some(ScsiOpcode::ServiceActionIn16),
            0xAA => Some(ScsiOpcode::Write12),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScsiOpcode::Inquiry => "INQUIRY",
            ScsiOpcode::Write10 => "WRITE10",
            ScsiOpcode::Write16 => "WRITE16",
            ScsiOpcode::WriteSame16 => "WRITESAME16",
            ScsiOpcode::ServiceActionIn16 => "SERVICE ACTION IN(16)",
            ScsiOpcode::Write12 => "WRITE12",
        }
    }
}

/// READ CAPACITY (16) service action of SERVICE ACTION IN (16)
pub const SAI_READ_CAPACITY_16: u8 = 0x10;

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Name of a SCSI status byte for diagnostics
pub fn status_name(status: u8) -> &'static str {
    match status {
        scsi_status::GOOD => "GOOD",
        scsi_status::CHECK_CONDITION => "CHECK CONDITION",
        scsi_status::CONDITION_MET => "CONDITION MET",
        scsi_status::BUSY => "BUSY",
        scsi_status::RESERVATION_CONFLICT => "RESERVATION CONFLICT",
        scsi_status::TASK_SET_FULL => "TASK SET FULL",
        scsi_status::ACA_ACTIVE => "ACA ACTIVE",
        scsi_status::TASK_ABORTED => "TASK ABORTED",
        _ => "UNKNOWN",
    }
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const MISCOMPARE: u8 = 0x0E;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const WRITE_PROTECTED: u8 = 0x27;
}

/// SCSI sense data, from either fixed or descriptor format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    /// 0x70/0x71 fixed, 0x72/0x73 descriptor
    pub response_code: u8,
    pub sense_key: u8,
    pub asc: u8,        // Additional Sense Code
    pub ascq: u8,       // Additional Sense Code Qualifier
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            response_code: 0x70,
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    /// Parse sense bytes as returned in a SCSI Response
    pub fn parse(data: &[u8]) -> ScsiResult<Self> {
        if data.is_empty() {
            return Err(IscsiError::Scsi("Empty sense data".to_string()));
        }

        let response_code = data[0] & 0x7F;
        match response_code {
            0x70 | 0x71 => {
                if data.len() < 14 {
                    return Err(IscsiError::Scsi(format!(
                        "Fixed format sense too short: {} bytes",
                        data.len()
                    )));
                }
                Ok(SenseData {
                    response_code,
                    sense_key: data[2] & 0x0F,
                    asc: data[12],
                    ascq: data[13],
                    information: BigEndian::read_u32(&data[3..7]),
                })
            }
            0x72 | 0x73 => {
                if data.len() < 4 {
                    return Err(IscsiError::Scsi(format!(
                        "Descriptor format sense too short: {} bytes",
                        data.len()
                    )));
                }
                Ok(SenseData {
                    response_code,
                    sense_key: data[1] & 0x0F,
                    asc: data[2],
                    ascq: data[3],
                    information: 0,
                })
            }
            other => Err(IscsiError::Scsi(format!(
                "Unknown sense response code 0x{:02x}",
                other
            ))),
        }
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);
        data[7] = 10; // Remaining bytes after this field
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }

    /// ILLEGAL REQUEST / INVALID COMMAND OPERATION CODE
    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    /// ILLEGAL REQUEST / INVALID FIELD IN CDB
    pub fn invalid_field_in_cdb() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    }

    pub fn is_invalid_command(&self) -> bool {
        self.sense_key == sense_key::ILLEGAL_REQUEST
            && self.asc == asc::INVALID_COMMAND_OPERATION_CODE
            && self.ascq == 0
    }

    pub fn is_invalid_field_in_cdb(&self) -> bool {
        self.sense_key == sense_key::ILLEGAL_REQUEST
            && self.asc == asc::INVALID_FIELD_IN_CDB
            && self.ascq == 0
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sense key 0x{:x} ASC/ASCQ 0x{:02x}/0x{:02x}",
            self.sense_key, self.asc, self.ascq
        )?;
        if self.is_invalid_command() {
            write!(f, " (INVALID COMMAND OPERATION CODE)")?;
        } else if self.is_invalid_field_in_cdb() {
            write!(f, " (INVALID FIELD IN CDB)")?;
        }
        Ok(())
    }
}

// ============================================================================
// CDB builders
// ============================================================================

/// Optional bits of the WRITE (10/12/16) CDBs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags {
    pub wrprotect: u8,
    pub dpo: bool,
    pub fua: bool,
    pub fua_nv: bool,
    pub group_number: u8,
}

impl WriteFlags {
    pub fn dpo(mut self) -> Self {
        self.dpo = true;
        self
    }

    pub fn fua(mut self) -> Self {
        self.fua = true;
        self
    }

    pub fn fua_nv(mut self) -> Self {
        self.fua_nv = true;
        self
    }

    pub fn wrprotect(mut self, value: u8) -> Self {
        self.wrprotect = value;
        self
    }

    /// Byte 1: WRPROTECT[7:5] DPO[4] FUA[3] FUA_NV[1]
    fn byte1(&self) -> ScsiResult<u8> {
        check_wrprotect(self.wrprotect)?;
        Ok((self.wrprotect << 5)
            | (u8::from(self.dpo) << 4)
            | (u8::from(self.fua) << 3)
            | (u8::from(self.fua_nv) << 1))
    }
}

impl fmt::Display for WriteFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WRPROTECT={} DPO={} FUA={} FUA_NV={}",
            self.wrprotect,
            u8::from(self.dpo),
            u8::from(self.fua),
            u8::from(self.fua_nv)
        )
    }
}

/// Optional bits of the WRITE SAME (16) CDB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteSameFlags {
    pub wrprotect: u8,
    pub anchor: bool,
    pub unmap: bool,
    pub ndob: bool,
    pub group_number: u8,
}

impl WriteSameFlags {
    pub fn wrprotect(mut self, value: u8) -> Self {
        self.wrprotect = value;
        self
    }

    /// Byte 1: WRPROTECT[7:5] ANCHOR[4] UNMAP[3] NDOB[0]
    fn byte1(&self) -> ScsiResult<u8> {
        check_wrprotect(self.wrprotect)?;
        Ok((self.wrprotect << 5)
            | (u8::from(self.anchor) << 4)
            | (u8::from(self.unmap) << 3)
            | u8::from(self.ndob))
    }
}

fn check_wrprotect(value: u8) -> ScsiResult<()> {
    if value > 7 {
        return Err(IscsiError::Scsi(format!(
            "WRPROTECT is a 3-bit field, got {}",
            value
        )));
    }
    Ok(())
}

fn group_number(value: u8) -> ScsiResult<u8> {
    if value > 0x1F {
        return Err(IscsiError::Scsi(format!(
            "GROUP NUMBER is a 5-bit field, got {}",
            value
        )));
    }
    Ok(value)
}

/// WRITE (10): LBA bytes 2-5, group byte 6, length bytes 7-8
pub fn write10_cdb(lba: u32, blocks: u16, flags: &WriteFlags) -> ScsiResult<[u8; 10]> {
    let mut cdb = [0u8; 10];
    cdb[0] = ScsiOpcode::Write10 as u8;
    cdb[1] = flags.byte1()?;
    BigEndian::write_u32(&mut cdb[2..6], lba);
    cdb[6] = group_number(flags.group_number)?;
    BigEndian::write_u16(&mut cdb[7..9], blocks);
    Ok(cdb)
}

/// WRITE (12): LBA bytes 2-5, length bytes 6-9, group byte 10
pub fn write12_cdb(lba: u32, blocks: u32, flags: &WriteFlags) -> ScsiResult<[u8; 12]> {
    let mut cdb = [0u8; 12];
    cdb[0] = ScsiOpcode::Write12 as u8;
    cdb[1] = flags.byte1()?;
    BigEndian::write_u32(&mut cdb[2..6], lba);
    BigEndian::write_u32(&mut cdb[6..10], blocks);
    cdb[10] = group_number(flags.group_number)?;
    Ok(cdb)
}

/// WRITE (16): LBA bytes 2-9, length bytes 10-13, group byte 14
///
/// WRITE (16) has no FUA_NV bit; it is cleared.
pub fn write16_cdb(lba: u64, blocks: u32, flags: &WriteFlags) -> ScsiResult<[u8; 16]> {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::Write16 as u8;
    cdb[1] = flags.byte1()? & 0xF8;
    BigEndian::write_u64(&mut cdb[2..10], lba);
    BigEndian::write_u32(&mut cdb[10..14], blocks);
    cdb[14] = group_number(flags.group_number)?;
    Ok(cdb)
}

/// WRITE SAME (16): LBA bytes 2-9, number of blocks bytes 10-13, group byte 14
pub fn write_same16_cdb(lba: u64, blocks: u32, flags: &WriteSameFlags) -> ScsiResult<[u8; 16]> {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::WriteSame16 as u8;
    cdb[1] = flags.byte1()?;
    BigEndian::write_u64(&mut cdb[2..10], lba);
    BigEndian::write_u32(&mut cdb[10..14], blocks);
    cdb[14] = group_number(flags.group_number)?;
    Ok(cdb)
}

/// Standard INQUIRY
pub fn inquiry_cdb(alloc_len: u16) -> [u8; 6] {
    let mut cdb = [0u8; 6];
    cdb[0] = ScsiOpcode::Inquiry as u8;
    BigEndian::write_u16(&mut cdb[3..5], alloc_len);
    cdb
}

/// READ CAPACITY (16)
pub fn read_capacity16_cdb(alloc_len: u32) -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ScsiOpcode::ServiceActionIn16 as u8;
    cdb[1] = SAI_READ_CAPACITY_16;
    BigEndian::write_u32(&mut cdb[10..14], alloc_len);
    cdb
}

// ============================================================================
// Response parsers
// ============================================================================

/// Fields of the standard INQUIRY data this crate cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    pub peripheral_qualifier: u8,
    pub device_type: u8,
    pub version: u8,
    /// PROTECT: the logical unit supports protection information
    pub protect: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl InquiryData {
    pub fn parse(data: &[u8]) -> ScsiResult<Self> {
        if data.len() < 6 {
            return Err(IscsiError::Scsi(format!(
                "INQUIRY data too short: {} bytes",
                data.len()
            )));
        }

        let text = |range: std::ops::Range<usize>| {
            data.get(range)
                .map(|b| String::from_utf8_lossy(b).trim_end().to_string())
                .unwrap_or_default()
        };

        Ok(InquiryData {
            peripheral_qualifier: data[0] >> 5,
            device_type: data[0] & 0x1F,
            version: data[2],
            protect: data[5] & 0x01 != 0,
            vendor: text(8..16),
            product: text(16..32),
            revision: text(32..36),
        })
    }
}

/// READ CAPACITY (16) parameter data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCapacity16 {
    pub last_lba: u64,
    pub block_length: u32,
    /// PROT_EN: protection information is enabled on the medium
    pub prot_en: bool,
    pub p_type: u8,
    pub lbppbe: u8,
}

impl ReadCapacity16 {
    pub fn parse(data: &[u8]) -> ScsiResult<Self> {
        if data.len() < 14 {
            return Err(IscsiError::Scsi(format!(
                "READ CAPACITY (16) data too short: {} bytes",
                data.len()
            )));
        }

        Ok(ReadCapacity16 {
            last_lba: BigEndian::read_u64(&data[0..8]),
            block_length: BigEndian::read_u32(&data[8..12]),
            prot_en: data[12] & 0x01 != 0,
            p_type: (data[12] >> 1) & 0x07,
            lbppbe: data[13] & 0x0F,
        })
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
