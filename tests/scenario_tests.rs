//! Named scenarios end to end against the loopback target

mod common;

use common::{LoopbackTarget, TargetPolicy};
use iscsi_conformance::header;
use iscsi_conformance::pdu::{self, opcode};
use iscsi_conformance::scenarios;
use iscsi_conformance::ScenarioOutcome;

/// Commands received with this CDB opcode
fn commands_with(target: &LoopbackTarget, cdb_opcode: u8) -> Vec<pdu::ScsiCommandPdu> {
    target
        .commands()
        .into_iter()
        .filter(|c| c.cdb[0] == cdb_opcode)
        .collect()
}

fn data_out_lengths(target: &LoopbackTarget) -> Vec<usize> {
    target
        .received_full_feature()
        .iter()
        .filter(|pdu| pdu.opcode == opcode::SCSI_DATA_OUT)
        .map(|pdu| pdu.data.len())
        .collect()
}

fn unsolicited_policy() -> TargetPolicy {
    TargetPolicy {
        immediate_data: Some("No"),
        initial_r2t: Some("No"),
        ..TargetPolicy::default()
    }
}

#[test]
fn test_unsolicited_nonimmediate_data_passes() {
    common::init_logging();
    let target = LoopbackTarget::start(unsolicited_policy());

    let outcome = scenarios::unsolicited_nonimmediate_data(&target.config(true));
    assert_eq!(outcome, ScenarioOutcome::Passed);

    let shapes: Vec<(u8, bool, u32)> = target
        .received_full_feature()
        .iter()
        .map(|pdu| {
            let raw = pdu.to_bytes();
            (
                header::opcode(&raw),
                header::is_final(&raw),
                header::data_segment_length(&raw),
            )
        })
        .collect();
    // READ CAPACITY (16) for the block size, then the write
    assert_eq!(
        shapes,
        vec![
            (opcode::SCSI_COMMAND, true, 0),
            (opcode::SCSI_COMMAND, false, 0),
            (opcode::SCSI_DATA_OUT, true, 512)
        ]
    );
}

#[test]
fn test_unsolicited_nonimmediate_data_uses_device_block_size() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        block_size: 4096,
        ..unsolicited_policy()
    });

    // config.block_size stays at 512
    let outcome = scenarios::unsolicited_nonimmediate_data(&target.config(true));
    assert_eq!(outcome, ScenarioOutcome::Passed);

    let writes = commands_with(&target, 0x2A);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].expected_data_length, 4096);
    assert_eq!(&writes[0].cdb[7..9], &[0, 1]);
    assert_eq!(data_out_lengths(&target), vec![4096]);
}

#[test]
fn test_unsolicited_nonimmediate_data_falls_back_to_configured_block_size() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        read_capacity16_supported: false,
        ..unsolicited_policy()
    });

    let outcome = scenarios::unsolicited_nonimmediate_data(&target.config(true));
    assert_eq!(outcome, ScenarioOutcome::Passed);
    assert_eq!(data_out_lengths(&target), vec![512]);
}

#[test]
fn test_wrong_block_size_is_refused_by_target() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        block_size: 4096,
        read_capacity16_supported: false,
        ..unsolicited_policy()
    });

    // Without READ CAPACITY (16) the configured 512 is all there is
    match scenarios::unsolicited_nonimmediate_data(&target.config(true)) {
        ScenarioOutcome::Failed(reason) => assert!(reason.contains("WRITE10 failed"), "{}", reason),
        other => panic!("expected failure, got {}", other),
    }
}

#[test]
fn test_unsolicited_nonimmediate_data_requires_data_loss() {
    common::init_logging();
    let target = LoopbackTarget::start(unsolicited_policy());

    let outcome = scenarios::unsolicited_nonimmediate_data(&target.config(false));
    assert_eq!(outcome.code(), -2);
    assert!(target.received().is_empty());
}

#[test]
fn test_unsolicited_nonimmediate_data_skips_when_r2t_forced() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        immediate_data: Some("No"),
        initial_r2t: Some("Yes"),
        ..TargetPolicy::default()
    });

    let outcome = scenarios::unsolicited_nonimmediate_data(&target.config(true));
    assert!(matches!(outcome, ScenarioOutcome::Skipped(_)), "{}", outcome);
    assert!(target.commands().is_empty());
}

#[test]
fn test_unsolicited_nonimmediate_data_fails_without_immediate_data_answer() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        immediate_data: None,
        initial_r2t: Some("No"),
        ..TargetPolicy::default()
    });

    let outcome = scenarios::unsolicited_nonimmediate_data(&target.config(true));
    assert_eq!(outcome.code(), -1, "{}", outcome);
}

#[test]
fn test_unsolicited_nonimmediate_data_fails_on_login_reject() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        login_status: Some((0x02, 0x02)),
        ..unsolicited_policy()
    });

    match scenarios::unsolicited_nonimmediate_data(&target.config(true)) {
        ScenarioOutcome::Failed(reason) => assert!(reason.contains("Authorization"), "{}", reason),
        other => panic!("expected failure, got {}", other),
    }
}

#[test]
fn test_immediate_data_passes() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy::default());

    let outcome = scenarios::immediate_data(&target.config(true));
    assert_eq!(outcome, ScenarioOutcome::Passed);

    let commands = commands_with(&target, 0x2A);
    assert_eq!(commands.len(), 1);
    assert!(commands[0].final_flag);
    assert!(data_out_lengths(&target).is_empty());
}

#[test]
fn test_immediate_data_uses_device_block_size() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        block_size: 4096,
        ..TargetPolicy::default()
    });

    let outcome = scenarios::immediate_data(&target.config(true));
    assert_eq!(outcome, ScenarioOutcome::Passed);

    let commands = commands_with(&target, 0x2A);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].expected_data_length, 4096);
}

#[test]
fn test_immediate_data_skips_when_refused() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        immediate_data: Some("No"),
        ..TargetPolicy::default()
    });

    let outcome = scenarios::immediate_data(&target.config(true));
    assert_eq!(outcome.code(), -2, "{}", outcome);
}

#[test]
fn test_write12_flags_passes() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy::default());

    let outcome = scenarios::write12_flags(&target.config(true));
    assert_eq!(outcome.code(), 0, "{}", outcome);

    let byte1: Vec<u8> = commands_with(&target, 0xAA).iter().map(|c| c.cdb[1]).collect();
    assert_eq!(byte1, vec![0x10, 0x08, 0x0A, 0x02, 0x1A]);
}

#[test]
fn test_write12_flags_uses_device_block_size() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        block_size: 4096,
        ..TargetPolicy::default()
    });

    let outcome = scenarios::write12_flags(&target.config(true));
    assert_eq!(outcome.code(), 0, "{}", outcome);
    assert!(commands_with(&target, 0xAA)
        .iter()
        .all(|c| c.expected_data_length == 4096));
}

#[test]
fn test_write12_flags_stops_when_not_implemented() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        write12_supported: false,
        ..TargetPolicy::default()
    });

    let outcome = scenarios::write12_flags(&target.config(true));
    assert_eq!(outcome, ScenarioOutcome::Skipped("WRITE12 is not implemented".to_string()));
    assert_eq!(commands_with(&target, 0xAA).len(), 1);
}

#[test]
fn test_writesame16_wrprotect_without_protection() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy::default());

    let outcome = scenarios::writesame16_wrprotect(&target.config(true));
    assert_eq!(outcome.code(), 0, "{}", outcome);

    let wrprotects: Vec<u8> = target
        .commands()
        .iter()
        .filter(|c| c.cdb[0] == 0x93)
        .map(|c| c.cdb[1] >> 5)
        .collect();
    assert_eq!(wrprotects, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn test_writesame16_wrprotect_uses_device_block_size() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        block_size: 4096,
        ..TargetPolicy::default()
    });

    // A 512-byte block would be refused for its length, not for WRPROTECT
    let outcome = scenarios::writesame16_wrprotect(&target.config(true));
    assert_eq!(outcome.code(), 0, "{}", outcome);
    assert!(commands_with(&target, 0x93)
        .iter()
        .all(|c| c.expected_data_length == 4096));
}

#[test]
fn test_writesame16_wrprotect_protect_bit_without_prot_en() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        protect: true,
        prot_en: false,
        ..TargetPolicy::default()
    });

    let outcome = scenarios::writesame16_wrprotect(&target.config(true));
    assert_eq!(outcome.code(), 0, "{}", outcome);
    assert_eq!(
        target.commands().iter().filter(|c| c.cdb[0] == 0x93).count(),
        7
    );
}

#[test]
fn test_writesame16_wrprotect_with_protection_sends_nothing() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        protect: true,
        prot_en: true,
        ..TargetPolicy::default()
    });

    let outcome = scenarios::writesame16_wrprotect(&target.config(true));
    assert_eq!(outcome, ScenarioOutcome::Passed);
    assert!(target.commands().iter().all(|c| c.cdb[0] != 0x93));
}

#[test]
fn test_writesame16_wrprotect_accumulates_failures() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        ignore_wrprotect: true,
        ..TargetPolicy::default()
    });

    match scenarios::writesame16_wrprotect(&target.config(true)) {
        ScenarioOutcome::Failed(reason) => {
            assert_eq!(reason.matches("got GOOD").count(), 7, "{}", reason);
        }
        other => panic!("expected failure, got {}", other),
    }
}

#[test]
fn test_writesame16_wrprotect_not_implemented() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        write_same16_supported: false,
        ..TargetPolicy::default()
    });

    let outcome = scenarios::writesame16_wrprotect(&target.config(true));
    assert_eq!(outcome.code(), -2, "{}", outcome);
    assert_eq!(
        target.commands().iter().filter(|c| c.cdb[0] == 0x93).count(),
        1
    );
}

#[test]
fn test_writesame16_wrprotect_skips_non_block_devices() {
    common::init_logging();
    let target = LoopbackTarget::start(TargetPolicy {
        device_type: 0x05,
        ..TargetPolicy::default()
    });

    let outcome = scenarios::writesame16_wrprotect(&target.config(true));
    assert_eq!(outcome.code(), -2, "{}", outcome);
}
