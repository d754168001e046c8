//! CDB field probes
//!
//! A probe sends one command with caller-chosen CDB bits and checks how the
//! target answered. "Not implemented" is kept apart from "wrong answer" so a
//! scenario can skip commands the target does not support instead of failing.
//!
//! Probes never retry. Transport and session errors come back as `Err`;
//! everything the target says in SCSI terms comes back as a [`ProbeOutcome`].

use std::fmt;

use crate::client::{DataTransfer, IscsiClient, ScsiTask};
use crate::error::{IscsiError, ScsiResult};
use crate::scsi::{self, scsi_status, SenseData, WriteFlags, WriteSameFlags};

/// What the target said, reduced to the cases probes distinguish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetResponse {
    Good,
    /// ILLEGAL REQUEST / INVALID COMMAND OPERATION CODE
    NotImplemented,
    /// ILLEGAL REQUEST / INVALID FIELD IN CDB
    InvalidFieldInCdb,
    Failed {
        status: u8,
        sense: Option<SenseData>,
    },
}

impl TargetResponse {
    pub fn classify(task: &ScsiTask) -> Self {
        if task.is_good() {
            return TargetResponse::Good;
        }
        if task.status == scsi_status::CHECK_CONDITION {
            match &task.sense {
                Some(sense) if sense.is_invalid_command() => return TargetResponse::NotImplemented,
                Some(sense) if sense.is_invalid_field_in_cdb() => {
                    return TargetResponse::InvalidFieldInCdb
                }
                _ => {}
            }
        }
        TargetResponse::Failed {
            status: task.status,
            sense: task.sense.clone(),
        }
    }
}

impl fmt::Display for TargetResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetResponse::Good => write!(f, "GOOD"),
            TargetResponse::NotImplemented => write!(f, "INVALID COMMAND OPERATION CODE"),
            TargetResponse::InvalidFieldInCdb => write!(f, "INVALID FIELD IN CDB"),
            TargetResponse::Failed {
                status,
                sense: Some(sense),
            } => write!(f, "{} ({})", scsi::status_name(*status), sense),
            TargetResponse::Failed { status, sense: None } => {
                write!(f, "{}", scsi::status_name(*status))
            }
        }
    }
}

/// The answer a probe requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Good,
    InvalidFieldInCdb,
}

impl Expectation {
    fn is_met_by(self, response: &TargetResponse) -> bool {
        matches!(
            (self, response),
            (Expectation::Good, TargetResponse::Good)
                | (Expectation::InvalidFieldInCdb, TargetResponse::InvalidFieldInCdb)
        )
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Good => write!(f, "GOOD"),
            Expectation::InvalidFieldInCdb => write!(f, "INVALID FIELD IN CDB"),
        }
    }
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Passed,
    /// The target does not implement the opcode
    NotImplemented,
    Failed(String),
}

impl ProbeOutcome {
    /// Check a classified response against what was required
    pub fn judge(command: &str, response: TargetResponse, expected: Expectation) -> Self {
        if response == TargetResponse::NotImplemented {
            log::info!("[SKIPPED] {} is not implemented on this target", command);
            return ProbeOutcome::NotImplemented;
        }
        if expected.is_met_by(&response) {
            return ProbeOutcome::Passed;
        }
        ProbeOutcome::Failed(format!(
            "{} should have returned {}, got {}",
            command, expected, response
        ))
    }

    /// 0 passed, -2 not implemented, -1 failed
    pub fn code(&self) -> i32 {
        match self {
            ProbeOutcome::Passed => 0,
            ProbeOutcome::NotImplemented => -2,
            ProbeOutcome::Failed(_) => -1,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, ProbeOutcome::Passed)
    }
}

fn run(
    client: &mut IscsiClient,
    lun: u16,
    command: &str,
    cdb: &[u8],
    data: &[u8],
    expected: Expectation,
) -> ScsiResult<ProbeOutcome> {
    log::debug!("Probe {} CDB {}", command, hex::encode(cdb));
    let task = client.execute(lun, cdb, DataTransfer::Write(data), None)?;
    let response = TargetResponse::classify(&task);
    log::debug!("Probe {} answered {}", command, response);
    Ok(ProbeOutcome::judge(command, response, expected))
}

fn block_count(data: &[u8], block_size: u32) -> ScsiResult<u32> {
    if block_size == 0 || data.is_empty() || data.len() % block_size as usize != 0 {
        return Err(IscsiError::Scsi(format!(
            "Probe data of {} bytes is not a whole number of {}-byte blocks",
            data.len(),
            block_size
        )));
    }
    u32::try_from(data.len() / block_size as usize)
        .map_err(|_| IscsiError::Scsi(format!("Probe data of {} bytes is too large", data.len())))
}

/// WRITE (10) expected to succeed
pub fn write10(
    client: &mut IscsiClient,
    lun: u16,
    lba: u32,
    block_size: u32,
    data: &[u8],
    flags: &WriteFlags,
) -> ScsiResult<ProbeOutcome> {
    let blocks = block_count(data, block_size)?;
    let blocks = u16::try_from(blocks)
        .map_err(|_| IscsiError::Scsi(format!("WRITE10 cannot carry {} blocks", blocks)))?;
    let cdb = scsi::write10_cdb(lba, blocks, flags)?;
    run(client, lun, &format!("WRITE10 {}", flags), &cdb, data, Expectation::Good)
}

fn write12_with(
    client: &mut IscsiClient,
    lun: u16,
    lba: u32,
    block_size: u32,
    data: &[u8],
    flags: &WriteFlags,
    expected: Expectation,
) -> ScsiResult<ProbeOutcome> {
    let cdb = scsi::write12_cdb(lba, block_count(data, block_size)?, flags)?;
    run(client, lun, &format!("WRITE12 {}", flags), &cdb, data, expected)
}

/// WRITE (12) expected to succeed
pub fn write12(
    client: &mut IscsiClient,
    lun: u16,
    lba: u32,
    block_size: u32,
    data: &[u8],
    flags: &WriteFlags,
) -> ScsiResult<ProbeOutcome> {
    write12_with(client, lun, lba, block_size, data, flags, Expectation::Good)
}

/// WRITE (12) expected to fail with INVALID FIELD IN CDB
pub fn write12_invalid_field(
    client: &mut IscsiClient,
    lun: u16,
    lba: u32,
    block_size: u32,
    data: &[u8],
    flags: &WriteFlags,
) -> ScsiResult<ProbeOutcome> {
    write12_with(
        client,
        lun,
        lba,
        block_size,
        data,
        flags,
        Expectation::InvalidFieldInCdb,
    )
}

/// WRITE (16) expected to succeed
pub fn write16(
    client: &mut IscsiClient,
    lun: u16,
    lba: u64,
    block_size: u32,
    data: &[u8],
    flags: &WriteFlags,
) -> ScsiResult<ProbeOutcome> {
    let cdb = scsi::write16_cdb(lba, block_count(data, block_size)?, flags)?;
    run(client, lun, &format!("WRITE16 {}", flags), &cdb, data, Expectation::Good)
}

fn write_same16_with(
    client: &mut IscsiClient,
    lun: u16,
    lba: u64,
    blocks: u32,
    block: &[u8],
    flags: &WriteSameFlags,
    expected: Expectation,
) -> ScsiResult<ProbeOutcome> {
    let cdb = scsi::write_same16_cdb(lba, blocks, flags)?;
    let command = format!("WRITESAME16 WRPROTECT={}", flags.wrprotect);
    run(client, lun, &command, &cdb, block, expected)
}

/// WRITE SAME (16) of one `block` over `blocks` LBAs, expected to succeed
pub fn write_same16(
    client: &mut IscsiClient,
    lun: u16,
    lba: u64,
    blocks: u32,
    block: &[u8],
    flags: &WriteSameFlags,
) -> ScsiResult<ProbeOutcome> {
    write_same16_with(client, lun, lba, blocks, block, flags, Expectation::Good)
}

/// WRITE SAME (16) expected to fail with INVALID FIELD IN CDB
pub fn write_same16_invalid_field(
    client: &mut IscsiClient,
    lun: u16,
    lba: u64,
    blocks: u32,
    block: &[u8],
    flags: &WriteSameFlags,
) -> ScsiResult<ProbeOutcome> {
    write_same16_with(
        client,
        lun,
        lba,
        blocks,
        block,
        flags,
        Expectation::InvalidFieldInCdb,
    )
}
