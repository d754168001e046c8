//! Named conformance scenarios
//!
//! Each scenario opens its own connection from a [`ConformanceConfig`], logs
//! in with the parameters it needs and reports a [`ScenarioOutcome`].
//! Connection and login errors are reported as failures, not propagated.

use std::fmt;

use crate::client::IscsiClient;
use crate::config::ConformanceConfig;
use crate::error::ScsiResult;
use crate::interceptor::{ValidationReport, Validator};
use crate::probe::{self, ProbeOutcome};
use crate::rules::RuleSet;
use crate::scsi::{WriteFlags, WriteSameFlags};
use crate::session::{LoginOptions, Negotiated};

/// Result of a whole scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioOutcome {
    Passed,
    Skipped(String),
    Failed(String),
}

impl ScenarioOutcome {
    /// 0 passed, -2 skipped, -1 failed
    pub fn code(&self) -> i32 {
        match self {
            ScenarioOutcome::Passed => 0,
            ScenarioOutcome::Skipped(_) => -2,
            ScenarioOutcome::Failed(_) => -1,
        }
    }

    fn from_failures(failures: Vec<String>) -> Self {
        if failures.is_empty() {
            ScenarioOutcome::Passed
        } else {
            ScenarioOutcome::Failed(failures.join("; "))
        }
    }
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioOutcome::Passed => write!(f, "[OK]"),
            ScenarioOutcome::Skipped(reason) => write!(f, "[SKIPPED] {}", reason),
            ScenarioOutcome::Failed(reason) => write!(f, "[FAILED] {}", reason),
        }
    }
}

fn data_loss_guard(config: &ConformanceConfig) -> Option<ScenarioOutcome> {
    if config.data_loss {
        return None;
    }
    Some(ScenarioOutcome::Skipped(
        "data_loss is not enabled; refusing to overwrite blocks".to_string(),
    ))
}

fn connect(config: &ConformanceConfig, options: &LoginOptions) -> ScsiResult<IscsiClient> {
    let mut client = IscsiClient::connect_with_timeout(&config.portal, config.io_timeout)?;
    client.login(options)?;
    Ok(client)
}

/// Logical block length reported by READ CAPACITY (16), else the configured one
fn device_block_size(client: &mut IscsiClient, config: &ConformanceConfig) -> u32 {
    match client.read_capacity16(config.lun) {
        Ok(capacity) if capacity.block_length > 0 => capacity.block_length,
        Ok(_) => config.block_size,
        Err(e) => {
            log::debug!(
                "READ CAPACITY (16) unavailable ({}), using block size {}",
                e,
                config.block_size
            );
            config.block_size
        }
    }
}

fn finish(name: &str, client: Option<IscsiClient>, result: ScsiResult<ScenarioOutcome>) -> ScenarioOutcome {
    if let Some(mut client) = client {
        if let Err(e) = client.logout() {
            log::debug!("{}: logout failed: {}", name, e);
        }
    }
    let outcome = result.unwrap_or_else(|e| ScenarioOutcome::Failed(e.to_string()));
    log::info!("{}: {}", name, outcome);
    outcome
}

/// Write one block as unsolicited, non-immediate data.
///
/// Logs in with ImmediateData=No and InitialR2T=No, then checks that the
/// command PDU has F clear and no data, and that a single final Data-Out
/// carries the block.
pub fn unsolicited_nonimmediate_data(config: &ConformanceConfig) -> ScenarioOutcome {
    const NAME: &str = "unsolicited_nonimmediate_data";
    if let Some(skip) = data_loss_guard(config) {
        return skip;
    }

    log::info!("{}: login with ImmediateData=No InitialR2T=No", NAME);
    let options = config.login_options().immediate_data(false).initial_r2t(false);
    let mut client = match connect(config, &options) {
        Ok(client) => client,
        Err(e) => {
            return finish(
                NAME,
                None,
                Ok(ScenarioOutcome::Failed(format!(
                    "Failed to log in with ImmediateData=No and InitialR2T=No: {}",
                    e
                ))),
            )
        }
    };

    let result = write_unsolicited_block(&mut client, config);
    finish(NAME, Some(client), result)
}

fn write_unsolicited_block(
    client: &mut IscsiClient,
    config: &ConformanceConfig,
) -> ScsiResult<ScenarioOutcome> {
    let params = *client.session_params();
    if params.immediate_data != Negotiated::No {
        return Ok(ScenarioOutcome::Failed(
            "Failed to negotiate ImmediateData=No with target".to_string(),
        ));
    }
    if params.initial_r2t != Negotiated::No {
        return Ok(ScenarioOutcome::Skipped(
            "Target does not allow InitialR2T=No".to_string(),
        ));
    }

    let block_size = device_block_size(client, config);
    log::info!("Write one {}-byte block as unsolicited Data-Out", block_size);
    let block = vec![0u8; block_size as usize];
    let mut report = ValidationReport::new();
    let task = {
        let mut validator = Validator::new(
            RuleSet::unsolicited_non_immediate_data(block_size),
            &mut report,
        );
        client.write10(
            config.lun,
            0,
            &block,
            block_size,
            &WriteFlags::default(),
            Some(&mut validator),
        )?
    };

    if !report.is_valid() {
        return Ok(ScenarioOutcome::Failed(format!(
            "PDU to send was invalid: {}",
            report.summary()
        )));
    }
    if !task.is_good() {
        return Ok(ScenarioOutcome::Failed(format!(
            "WRITE10 failed: {}",
            task.describe()
        )));
    }
    Ok(ScenarioOutcome::Passed)
}

/// Write one block as immediate data.
///
/// Logs in with ImmediateData=Yes and InitialR2T=Yes; the command PDU must
/// be final and carry the whole block, and no Data-Out may follow.
pub fn immediate_data(config: &ConformanceConfig) -> ScenarioOutcome {
    const NAME: &str = "immediate_data";
    if let Some(skip) = data_loss_guard(config) {
        return skip;
    }

    let options = config.login_options().immediate_data(true).initial_r2t(true);
    let mut client = match connect(config, &options) {
        Ok(client) => client,
        Err(e) => return finish(NAME, None, Err(e)),
    };

    let result = write_immediate_block(&mut client, config);
    finish(NAME, Some(client), result)
}

fn write_immediate_block(
    client: &mut IscsiClient,
    config: &ConformanceConfig,
) -> ScsiResult<ScenarioOutcome> {
    let params = *client.session_params();
    if !params.immediate_data_enabled() {
        return Ok(ScenarioOutcome::Skipped(
            "Target does not allow ImmediateData=Yes".to_string(),
        ));
    }
    let block_size = device_block_size(client, config);
    let rules = match RuleSet::for_session(&params, block_size) {
        Some(rules) => rules,
        None => {
            return Ok(ScenarioOutcome::Skipped(format!(
                "A {}-byte block does not fit in one immediate data segment",
                block_size
            )))
        }
    };

    log::info!("Write one block as immediate data ({})", rules.name());
    let block = vec![0u8; block_size as usize];
    let mut report = ValidationReport::new();
    let task = {
        let mut validator = Validator::new(rules, &mut report);
        client.write10(
            config.lun,
            0,
            &block,
            block_size,
            &WriteFlags::default(),
            Some(&mut validator),
        )?
    };

    if !report.is_valid() {
        return Ok(ScenarioOutcome::Failed(format!(
            "PDU to send was invalid: {}",
            report.summary()
        )));
    }
    if !task.is_good() {
        return Ok(ScenarioOutcome::Failed(format!(
            "WRITE10 failed: {}",
            task.describe()
        )));
    }
    Ok(ScenarioOutcome::Passed)
}

/// WRITE (12) with each combination of DPO, FUA and FUA_NV must succeed
pub fn write12_flags(config: &ConformanceConfig) -> ScenarioOutcome {
    const NAME: &str = "write12_flags";
    if let Some(skip) = data_loss_guard(config) {
        return skip;
    }

    let mut client = match connect(config, &config.login_options()) {
        Ok(client) => client,
        Err(e) => return finish(NAME, None, Err(e)),
    };

    let result = probe_write12_flags(&mut client, config);
    finish(NAME, Some(client), result)
}

fn probe_write12_flags(
    client: &mut IscsiClient,
    config: &ConformanceConfig,
) -> ScsiResult<ScenarioOutcome> {
    let block_size = device_block_size(client, config);
    let block = vec![0u8; block_size as usize];
    let combinations = [
        WriteFlags::default().dpo(),
        WriteFlags::default().fua(),
        WriteFlags::default().fua().fua_nv(),
        WriteFlags::default().fua_nv(),
        WriteFlags::default().dpo().fua().fua_nv(),
    ];

    let mut failures = Vec::new();
    for (i, flags) in combinations.iter().enumerate() {
        log::info!("Test WRITE12 with {}", flags);
        let outcome = probe::write12(client, config.lun, 0, block_size, &block, flags)?;
        match outcome {
            ProbeOutcome::Passed => {}
            ProbeOutcome::NotImplemented if i == 0 => {
                return Ok(ScenarioOutcome::Skipped(
                    "WRITE12 is not implemented".to_string(),
                ))
            }
            ProbeOutcome::NotImplemented => failures.push(format!(
                "WRITE12 {} reported not implemented after an earlier WRITE12 succeeded",
                flags
            )),
            ProbeOutcome::Failed(reason) => failures.push(reason),
        }
    }

    Ok(ScenarioOutcome::from_failures(failures))
}

/// WRITE SAME (16) with non-zero WRPROTECT on a device without protection
/// information must fail with INVALID FIELD IN CDB.
pub fn writesame16_wrprotect(config: &ConformanceConfig) -> ScenarioOutcome {
    const NAME: &str = "writesame16_wrprotect";
    if let Some(skip) = data_loss_guard(config) {
        return skip;
    }

    let mut client = match connect(config, &config.login_options()) {
        Ok(client) => client,
        Err(e) => return finish(NAME, None, Err(e)),
    };

    let result = probe_writesame16_wrprotect(&mut client, config);
    finish(NAME, Some(client), result)
}

fn probe_writesame16_wrprotect(
    client: &mut IscsiClient,
    config: &ConformanceConfig,
) -> ScsiResult<ScenarioOutcome> {
    let inquiry = client.inquiry(config.lun)?;
    if inquiry.device_type != 0x00 {
        return Ok(ScenarioOutcome::Skipped(format!(
            "Not a block device (peripheral device type 0x{:02x})",
            inquiry.device_type
        )));
    }

    // Missing READ CAPACITY (16) support is not fatal, it just means no PROT_EN
    let capacity = match client.read_capacity16(config.lun) {
        Ok(capacity) => Some(capacity),
        Err(e) => {
            log::debug!("READ CAPACITY (16) unavailable: {}", e);
            None
        }
    };

    let protection_in_use = inquiry.protect && capacity.map_or(true, |rc16| rc16.prot_en);
    let block_size = capacity
        .map(|rc16| rc16.block_length)
        .filter(|&length| length > 0)
        .unwrap_or(config.block_size);
    if protection_in_use {
        log::info!("No tests for devices that support protection information yet");
        return Ok(ScenarioOutcome::Passed);
    }

    log::info!("Device does not support/use protection information; every WRPROTECT should fail");
    let block = vec![0u8; block_size as usize];
    let mut failures = Vec::new();
    for wrprotect in 1..8u8 {
        let flags = WriteSameFlags::default().wrprotect(wrprotect);
        let outcome =
            probe::write_same16_invalid_field(client, config.lun, 0, 1, &block, &flags)?;
        match outcome {
            ProbeOutcome::Passed => {}
            ProbeOutcome::NotImplemented => {
                return Ok(ScenarioOutcome::Skipped(
                    "WRITESAME16 is not implemented".to_string(),
                ))
            }
            ProbeOutcome::Failed(reason) => failures.push(reason),
        }
    }

    Ok(ScenarioOutcome::from_failures(failures))
}
