//! Negotiated session parameters
//!
//! The initiator proposes operational keys during login and merges the
//! target's answers using the RFC 3720 Section 12 rules. The result is a
//! [`SessionParams`] snapshot that stays fixed for the life of the
//! connection and is what validation rules consult.

use crate::pdu::{parse_text_parameters, MAX_DATA_SEGMENT_LENGTH, MIN_DATA_SEGMENT_LENGTH};
use crate::error::ScsiResult;

/// Outcome of negotiating a boolean key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Negotiated {
    /// The target never answered the key
    #[default]
    NotNegotiated,
    Yes,
    No,
}

impl Negotiated {
    fn from_bool(value: bool) -> Self {
        if value {
            Negotiated::Yes
        } else {
            Negotiated::No
        }
    }

    /// Resolve to a bool, falling back to the RFC default when unanswered
    pub fn or_default(self, default: bool) -> bool {
        match self {
            Negotiated::Yes => true,
            Negotiated::No => false,
            Negotiated::NotNegotiated => default,
        }
    }
}

/// Digest type for header/data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

/// Keys the initiator offers in the operational login stage
#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub initiator_name: String,
    pub target_name: String,
    pub immediate_data: bool,
    pub initial_r2t: bool,
    /// Largest data segment this initiator accepts
    pub max_recv_data_segment_length: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
}

impl LoginOptions {
    /// Options with RFC defaults for the given names
    pub fn new(initiator_name: &str, target_name: &str) -> Self {
        LoginOptions {
            initiator_name: initiator_name.to_string(),
            target_name: target_name.to_string(),
            immediate_data: true,
            initial_r2t: true,
            max_recv_data_segment_length: 262_144,
            max_burst_length: 262_144,
            first_burst_length: 65_536,
        }
    }

    pub fn immediate_data(mut self, enabled: bool) -> Self {
        self.immediate_data = enabled;
        self
    }

    pub fn initial_r2t(mut self, required: bool) -> Self {
        self.initial_r2t = required;
        self
    }

    pub fn first_burst_length(mut self, len: u32) -> Self {
        self.first_burst_length = len;
        self
    }

    /// Operational stage key=value pairs
    pub fn operational_keys(&self) -> Vec<(&'static str, String)> {
        vec![
            ("HeaderDigest", "None".to_string()),
            ("DataDigest", "None".to_string()),
            (
                "MaxRecvDataSegmentLength",
                self.max_recv_data_segment_length.to_string(),
            ),
            ("MaxBurstLength", self.max_burst_length.to_string()),
            ("FirstBurstLength", self.first_burst_length.to_string()),
            ("DefaultTime2Wait", "2".to_string()),
            ("DefaultTime2Retain", "0".to_string()),
            ("MaxOutstandingR2T", "1".to_string()),
            ("ImmediateData", yes_no(self.immediate_data)),
            ("InitialR2T", yes_no(self.initial_r2t)),
            ("DataPDUInOrder", "Yes".to_string()),
            ("DataSequenceInOrder", "Yes".to_string()),
            ("ErrorRecoveryLevel", "0".to_string()),
        ]
    }
}

fn yes_no(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

/// Read-only snapshot of what login settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub immediate_data: Negotiated,
    pub initial_r2t: Negotiated,
    /// Largest data segment the target accepts from us
    pub target_max_recv_data_segment_length: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub header_digest: DigestType,
    pub data_digest: DigestType,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            immediate_data: Negotiated::NotNegotiated,
            initial_r2t: Negotiated::NotNegotiated,
            target_max_recv_data_segment_length: 8192,
            max_burst_length: 262_144,
            first_burst_length: 65_536,
            header_digest: DigestType::None,
            data_digest: DigestType::None,
        }
    }
}

impl SessionParams {
    /// Whether a command PDU may carry write data
    pub fn immediate_data_enabled(&self) -> bool {
        self.immediate_data.or_default(true)
    }

    /// Whether the target must send R2T before any Data-Out
    pub fn initial_r2t_required(&self) -> bool {
        self.initial_r2t.or_default(true)
    }

    /// Merge the target's login response keys with what we proposed
    pub fn negotiate(proposed: &LoginOptions, response: &[(String, String)]) -> Self {
        let mut params = SessionParams {
            max_burst_length: proposed.max_burst_length,
            first_burst_length: proposed.first_burst_length,
            ..SessionParams::default()
        };

        for (key, value) in response {
            params.apply_target_key(proposed, key, value);
        }

        if params.first_burst_length > params.max_burst_length {
            params.first_burst_length = params.max_burst_length;
        }

        params
    }

    /// Merge keys from the raw data segment of a Login Response
    pub fn negotiate_from_bytes(proposed: &LoginOptions, data: &[u8]) -> ScsiResult<Self> {
        let response = parse_text_parameters(data)?;
        Ok(Self::negotiate(proposed, &response))
    }

    fn apply_target_key(&mut self, proposed: &LoginOptions, key: &str, value: &str) {
        match key {
            "ImmediateData" => {
                // AND: only on if both sides want it
                self.immediate_data =
                    Negotiated::from_bool(proposed.immediate_data && value == "Yes");
            }
            "InitialR2T" => {
                // OR: on if either side wants it
                self.initial_r2t = Negotiated::from_bool(proposed.initial_r2t || value == "Yes");
            }
            "MaxRecvDataSegmentLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.target_max_recv_data_segment_length = clamp_length(key, v);
                }
            }
            "MaxBurstLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.max_burst_length = clamp_length(key, v).min(proposed.max_burst_length);
                }
            }
            "FirstBurstLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.first_burst_length =
                        clamp_length(key, v).min(proposed.first_burst_length);
                }
            }
            "HeaderDigest" => self.header_digest = parse_digest(value),
            "DataDigest" => self.data_digest = parse_digest(value),
            _ => {
                log::debug!("Ignoring login key from target: {}={}", key, value);
            }
        }
    }
}

/// Length keys are 512..=2^24-1 (RFC 3720 Section 12)
fn clamp_length(key: &str, value: u32) -> u32 {
    let clamped = value.clamp(MIN_DATA_SEGMENT_LENGTH, MAX_DATA_SEGMENT_LENGTH);
    if clamped != value {
        log::warn!(
            "Target sent {}={} outside 512..=16777215, using {}",
            key,
            value,
            clamped
        );
    }
    clamped
}

fn parse_digest(value: &str) -> DigestType {
    if value == "CRC32C" {
        DigestType::CRC32C
    } else {
        DigestType::None
    }
}
