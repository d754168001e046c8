//! iSCSI initiator conformance checks
//!
//! This library drives an iSCSI target through scenarios that check how the
//! initiator frames PDUs under negotiated session parameters and how the
//! target answers specific CDB flag combinations.
//!
//! Every operation that sends PDUs takes an optional [`PduInspector`]. A
//! [`Validator`] is an inspector that checks each outgoing PDU header against
//! a [`RuleSet`] and records violations in a [`ValidationReport`] owned by
//! the caller.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_conformance::{scenarios, ConformanceConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConformanceConfig::builder()
//!     .portal("127.0.0.1:3260")
//!     .target_name("iqn.2025-12.local:storage.disk1")
//!     .data_loss(true)
//!     .build()?;
//!
//! let outcome = scenarios::unsolicited_nonimmediate_data(&config);
//! println!("{} ({})", outcome, outcome.code());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod header;
pub mod interceptor;
pub mod pdu;
pub mod probe;
pub mod rules;
pub mod scenarios;
pub mod scsi;
pub mod session;

pub use client::{DataTransfer, IscsiClient, ScsiTask};
pub use config::{ConformanceConfig, ConformanceConfigBuilder};
pub use error::{IscsiError, ScsiResult};
pub use interceptor::{PduInspector, ValidationReport, Validator, Verdict};
pub use probe::{Expectation, ProbeOutcome, TargetResponse};
pub use rules::{Clause, RuleSet, Violation};
pub use scenarios::ScenarioOutcome;
pub use session::{LoginOptions, Negotiated, SessionParams};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
