//! Validation rules for outgoing PDU framing
//!
//! A [`RuleSet`] is a list of per-opcode [`Clause`]s. PDUs whose opcode no
//! clause mentions are accepted without being looked at.

use std::fmt;

use crate::header::BhsView;
use crate::pdu::{opcode, opcode_name};
use crate::session::SessionParams;

/// What a PDU of one opcode must look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    /// F-bit and DataSegmentLength must match exactly
    Shape {
        opcode: u8,
        final_bit: bool,
        data_segment_length: u32,
    },
    /// No PDU with this opcode may be sent
    Forbidden { opcode: u8 },
}

impl Clause {
    pub fn opcode(&self) -> u8 {
        match *self {
            Clause::Shape { opcode, .. } | Clause::Forbidden { opcode } => opcode,
        }
    }

    /// Check one PDU; the F-bit is checked before the length and only the
    /// first mismatch is reported
    pub fn check(&self, pdu: &BhsView<'_>) -> Result<(), Violation> {
        if pdu.opcode() != self.opcode() {
            return Ok(());
        }

        match *self {
            Clause::Forbidden { opcode } => Err(Violation::UnexpectedPdu { opcode }),
            Clause::Shape {
                opcode,
                final_bit,
                data_segment_length,
            } => {
                if pdu.is_final() != final_bit {
                    return Err(Violation::FinalBit {
                        opcode,
                        expected: final_bit,
                    });
                }
                let actual = pdu.data_segment_length();
                if actual != data_segment_length {
                    return Err(Violation::DataSegmentLength {
                        opcode,
                        expected: data_segment_length,
                        actual,
                    });
                }
                Ok(())
            }
        }
    }
}

/// Which clause a PDU broke
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    FinalBit { opcode: u8, expected: bool },
    DataSegmentLength { opcode: u8, expected: u32, actual: u32 },
    UnexpectedPdu { opcode: u8 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Violation::FinalBit { opcode, expected } => write!(
                f,
                "{} PDU had the F-bit {}",
                opcode_name(opcode),
                if expected {
                    "clear, expected it set"
                } else {
                    "set, expected it clear"
                }
            ),
            Violation::DataSegmentLength {
                opcode,
                expected,
                actual,
            } => write!(
                f,
                "{} PDU had DataSegmentLength {}, expected {}",
                opcode_name(opcode),
                actual,
                expected
            ),
            Violation::UnexpectedPdu { opcode } => {
                write!(f, "{} PDU should not have been sent", opcode_name(opcode))
            }
        }
    }
}

/// Named collection of clauses evaluated against every outgoing PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    name: &'static str,
    clauses: Vec<Clause>,
}

impl RuleSet {
    pub fn new(name: &'static str) -> Self {
        RuleSet {
            name,
            clauses: Vec::new(),
        }
    }

    pub fn with_clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// ImmediateData=No, InitialR2T=No, one block written.
    ///
    /// The command carries no data and does not claim finality; one
    /// unsolicited Data-Out carries the whole block and is final.
    pub fn unsolicited_non_immediate_data(block_size: u32) -> Self {
        RuleSet::new("unsolicited non-immediate data")
            .with_clause(Clause::Shape {
                opcode: opcode::SCSI_COMMAND,
                final_bit: false,
                data_segment_length: 0,
            })
            .with_clause(Clause::Shape {
                opcode: opcode::SCSI_DATA_OUT,
                final_bit: true,
                data_segment_length: block_size,
            })
    }

    /// ImmediateData=Yes and the block fits the first burst.
    ///
    /// The command carries the whole block and is final; no Data-Out follows.
    pub fn immediate_data(block_size: u32) -> Self {
        RuleSet::new("immediate data")
            .with_clause(Clause::Shape {
                opcode: opcode::SCSI_COMMAND,
                final_bit: true,
                data_segment_length: block_size,
            })
            .with_clause(Clause::Forbidden {
                opcode: opcode::SCSI_DATA_OUT,
            })
    }

    /// ImmediateData=No, InitialR2T=Yes: only solicited data.
    pub fn solicited_data(block_size: u32) -> Self {
        RuleSet::new("solicited data")
            .with_clause(Clause::Shape {
                opcode: opcode::SCSI_COMMAND,
                final_bit: true,
                data_segment_length: 0,
            })
            .with_clause(Clause::Shape {
                opcode: opcode::SCSI_DATA_OUT,
                final_bit: true,
                data_segment_length: block_size,
            })
    }

    /// Rules a one-block write must satisfy under the negotiated parameters.
    ///
    /// `None` when the block cannot travel in a single data-bearing PDU,
    /// which none of these rule sets describe.
    pub fn for_session(params: &SessionParams, block_size: u32) -> Option<Self> {
        let segment_limit = params.target_max_recv_data_segment_length;
        if block_size > segment_limit {
            return None;
        }

        let fits_first_burst = block_size <= params.first_burst_length;
        if params.immediate_data_enabled() {
            return fits_first_burst.then(|| RuleSet::immediate_data(block_size));
        }
        if !params.initial_r2t_required() {
            return fits_first_burst.then(|| RuleSet::unsolicited_non_immediate_data(block_size));
        }
        Some(RuleSet::solicited_data(block_size))
    }

    /// Violations found in one PDU, at most one per clause
    pub fn evaluate(&self, pdu: &BhsView<'_>) -> Vec<Violation> {
        self.clauses
            .iter()
            .filter_map(|clause| clause.check(pdu).err())
            .collect()
    }
}
