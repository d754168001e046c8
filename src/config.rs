//! Connection and target configuration for conformance runs
//!
//! Built with [`ConformanceConfig::builder`]; names are checked for IQN
//! format at build time so a typo fails before any socket is opened.

use crate::error::{IscsiError, ScsiResult};
use crate::session::LoginOptions;
use std::time::Duration;

const DEFAULT_PORTAL: &str = "127.0.0.1:3260";
const DEFAULT_INITIATOR: &str = "iqn.2025-12.local:conformance.initiator";

/// Where the target lives and what the scenarios may do to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConformanceConfig {
    pub portal: String,
    pub target_name: String,
    pub initiator_name: String,
    pub lun: u16,
    /// Logical block size assumed for writes
    pub block_size: u32,
    /// Scenarios that overwrite data run only when this is set
    pub data_loss: bool,
    pub io_timeout: Duration,
}

impl ConformanceConfig {
    /// Create a new builder for configuring a conformance run
    pub fn builder() -> ConformanceConfigBuilder {
        ConformanceConfigBuilder::default()
    }

    /// Login options for this initiator/target pair, RFC defaults otherwise
    pub fn login_options(&self) -> LoginOptions {
        LoginOptions::new(&self.initiator_name, &self.target_name)
    }
}

/// Builder for [`ConformanceConfig`]
#[derive(Debug, Default)]
pub struct ConformanceConfigBuilder {
    portal: Option<String>,
    target_name: Option<String>,
    initiator_name: Option<String>,
    lun: u16,
    block_size: Option<u32>,
    data_loss: bool,
    io_timeout: Option<Duration>,
}

impl ConformanceConfigBuilder {
    /// Target portal (default: 127.0.0.1:3260)
    pub fn portal(mut self, addr: &str) -> Self {
        self.portal = Some(addr.to_string());
        self
    }

    /// Set the iSCSI target name (IQN format)
    ///
    /// Example: iqn.2025-12.local:storage.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = Some(name.to_string());
        self
    }

    pub fn initiator_name(mut self, name: &str) -> Self {
        self.initiator_name = Some(name.to_string());
        self
    }

    pub fn lun(mut self, lun: u16) -> Self {
        self.lun = lun;
        self
    }

    /// Block size in bytes (default: 512)
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = Some(size);
        self
    }

    /// Allow scenarios that overwrite blocks on the target
    pub fn data_loss(mut self, allowed: bool) -> Self {
        self.data_loss = allowed;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ScsiResult<ConformanceConfig> {
        let target_name = self
            .target_name
            .ok_or_else(|| IscsiError::Config("target_name is required".to_string()))?;
        let initiator_name = self
            .initiator_name
            .unwrap_or_else(|| DEFAULT_INITIATOR.to_string());

        validate_iqn("target_name", &target_name)?;
        validate_iqn("initiator_name", &initiator_name)?;

        let block_size = self.block_size.unwrap_or(512);
        if block_size == 0 || block_size % 512 != 0 {
            return Err(IscsiError::Config(format!(
                "block_size must be a non-zero multiple of 512, got {}",
                block_size
            )));
        }

        Ok(ConformanceConfig {
            portal: self.portal.unwrap_or_else(|| DEFAULT_PORTAL.to_string()),
            target_name,
            initiator_name,
            lun: self.lun,
            block_size,
            data_loss: self.data_loss,
            io_timeout: self
                .io_timeout
                .unwrap_or(crate::client::DEFAULT_IO_TIMEOUT),
        })
    }
}

// Basic shape check: "iqn." prefix plus a naming-authority/name separator
fn validate_iqn(field: &str, name: &str) -> ScsiResult<()> {
    if !name.starts_with("iqn.") || !name.contains(':') {
        return Err(IscsiError::Config(format!(
            "{} must be in IQN format (e.g., iqn.2025-12.local:storage.disk1), got '{}'",
            field, name
        )));
    }
    Ok(())
}
