//! Send-path interception of outgoing PDUs
//!
//! Every client operation accepts an optional [`PduInspector`]. The client
//! serializes each PDU it is about to write and hands the exact wire bytes to
//! the inspector on the calling thread, right before the socket write.
//!
//! A [`Verdict::Reject`] is observational. The PDU is still transmitted; the
//! rejection is logged and counted on the task, and a [`Validator`] records
//! why in the [`ValidationReport`] owned by the caller.

use crate::header::BhsView;
use crate::pdu::opcode_name;
use crate::rules::{RuleSet, Violation};

/// Inspector decision for one PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Hook called with the wire bytes of each outgoing PDU
pub trait PduInspector {
    fn inspect(&mut self, pdu: &[u8]) -> Verdict;
}

impl<F> PduInspector for F
where
    F: FnMut(&[u8]) -> Verdict,
{
    fn inspect(&mut self, pdu: &[u8]) -> Verdict {
        self(pdu)
    }
}

/// Stand-in used when an operation runs without an inspector
pub(crate) struct PassThrough;

impl PduInspector for PassThrough {
    fn inspect(&mut self, _pdu: &[u8]) -> Verdict {
        Verdict::Accept
    }
}

/// A recorded rule violation with the PDU it was found in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedViolation {
    /// Position of the PDU among those inspected, from 0
    pub pdu_index: usize,
    pub opcode: u8,
    pub violation: Violation,
}

/// Verdict accumulator owned by one test
///
/// Starts valid. The first violation makes it invalid and nothing makes it
/// valid again.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    violations: Vec<RecordedViolation>,
    pdus_inspected: usize,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until the first violation
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[RecordedViolation] {
        &self.violations
    }

    pub fn first_violation(&self) -> Option<&RecordedViolation> {
        self.violations.first()
    }

    pub fn pdus_inspected(&self) -> usize {
        self.pdus_inspected
    }

    fn record(&mut self, opcode: u8, violation: Violation) {
        self.violations.push(RecordedViolation {
            pdu_index: self.pdus_inspected,
            opcode,
            violation,
        });
    }

    /// One line per violation, for failure messages
    pub fn summary(&self) -> String {
        if self.violations.is_empty() {
            return format!("{} PDUs inspected, all valid", self.pdus_inspected);
        }
        self.violations
            .iter()
            .map(|v| {
                format!(
                    "PDU #{} ({}): {}",
                    v.pdu_index,
                    opcode_name(v.opcode),
                    v.violation
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Inspector that evaluates a [`RuleSet`] and writes into a borrowed report
pub struct Validator<'r> {
    rules: RuleSet,
    report: &'r mut ValidationReport,
}

impl<'r> Validator<'r> {
    pub fn new(rules: RuleSet, report: &'r mut ValidationReport) -> Self {
        Validator { rules, report }
    }
}

impl PduInspector for Validator<'_> {
    fn inspect(&mut self, pdu: &[u8]) -> Verdict {
        let view = BhsView::new(pdu);
        let violations = self.rules.evaluate(&view);

        let verdict = if violations.is_empty() {
            Verdict::Accept
        } else {
            Verdict::Reject
        };

        for violation in violations {
            log::warn!(
                "{} PDU failed validation: {} (header {})",
                opcode_name(view.opcode()),
                violation,
                hex::encode(&pdu[..pdu.len().min(8)])
            );
            self.report.record(view.opcode(), violation);
        }
        self.report.pdus_inspected += 1;

        verdict
    }
}
