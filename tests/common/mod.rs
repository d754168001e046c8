//! In-process iSCSI target for integration tests
//!
//! Just enough of a target to log in, answer the commands the scenarios
//! send and record every PDU it receives so tests can look at what actually
//! went over the wire.

#![allow(dead_code)]

use iscsi_conformance::pdu::{self, flags, opcode, IscsiPdu, BHS_SIZE, RESERVED_TAG};
use iscsi_conformance::scsi::{scsi_status, sense_key, SenseData};
use iscsi_conformance::ConformanceConfig;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

pub const TARGET_IQN: &str = "iqn.2025-12.local:storage.loopback";
pub const INITIATOR_IQN: &str = "iqn.2025-12.local:conformance.tests";

const TARGET_TTT: u32 = 0x0000_1000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How the loopback target behaves
#[derive(Debug, Clone)]
pub struct TargetPolicy {
    /// Answer for ImmediateData; None leaves the key unanswered
    pub immediate_data: Option<&'static str>,
    pub initial_r2t: Option<&'static str>,
    pub max_recv_data_segment_length: u32,
    pub first_burst_length: u32,
    pub max_burst_length: u32,
    pub block_size: u32,
    pub device_type: u8,
    pub write12_supported: bool,
    pub write_same16_supported: bool,
    pub read_capacity16_supported: bool,
    /// INQUIRY PROTECT bit
    pub protect: bool,
    /// READ CAPACITY (16) PROT_EN bit
    pub prot_en: bool,
    /// Answer WRITE SAME (16) with GOOD whatever the WRPROTECT value
    pub ignore_wrprotect: bool,
    /// Refuse login with this status class/detail
    pub login_status: Option<(u8, u8)>,
    /// Send a NOP-In ping before each SCSI status
    pub ping_before_status: bool,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        TargetPolicy {
            immediate_data: Some("Yes"),
            initial_r2t: Some("Yes"),
            max_recv_data_segment_length: 8192,
            first_burst_length: 65_536,
            max_burst_length: 262_144,
            block_size: 512,
            device_type: 0x00,
            write12_supported: true,
            write_same16_supported: true,
            read_capacity16_supported: true,
            protect: false,
            prot_en: false,
            ignore_wrprotect: false,
            login_status: None,
            ping_before_status: false,
        }
    }
}

/// A listening target on an ephemeral localhost port
pub struct LoopbackTarget {
    addr: String,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl LoopbackTarget {
    pub fn start(policy: TargetPolicy) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback target");
        let addr = listener.local_addr().expect("local addr").to_string();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let mut conn = Connection::new(stream, &policy, Arc::clone(&sink));
                        if let Err(e) = conn.serve() {
                            log::debug!("loopback connection ended: {}", e);
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        LoopbackTarget { addr, received }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self, data_loss: bool) -> ConformanceConfig {
        ConformanceConfig::builder()
            .portal(&self.addr)
            .target_name(TARGET_IQN)
            .initiator_name(INITIATOR_IQN)
            .data_loss(data_loss)
            .build()
            .expect("loopback config")
    }

    /// Every PDU received so far, as raw bytes without padding
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    /// Received PDUs parsed, excluding login and logout traffic
    pub fn received_full_feature(&self) -> Vec<IscsiPdu> {
        self.received()
            .iter()
            .map(|raw| IscsiPdu::from_bytes(&padded(raw)).unwrap())
            .filter(|pdu| {
                pdu.opcode != opcode::LOGIN_REQUEST && pdu.opcode != opcode::LOGOUT_REQUEST
            })
            .collect()
    }

    /// Parsed SCSI Command PDUs received so far
    pub fn commands(&self) -> Vec<pdu::ScsiCommandPdu> {
        self.received_full_feature()
            .iter()
            .filter(|pdu| pdu.opcode == opcode::SCSI_COMMAND)
            .map(|pdu| pdu.parse_scsi_command().unwrap())
            .collect()
    }
}

/// Write data does not match the CDB transfer length
fn length_mismatch() -> SenseData {
    SenseData::new(sense_key::ABORTED_COMMAND, 0x0C, 0x0D)
}

fn padded(raw: &[u8]) -> Vec<u8> {
    let mut buf = raw.to_vec();
    buf.resize(raw.len().div_ceil(4) * 4, 0);
    buf
}

/// Status, sense and Data-In payload for one command
type Answer = (u8, Option<SenseData>, Option<Vec<u8>>);

struct Connection<'p> {
    stream: TcpStream,
    policy: &'p TargetPolicy,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    stat_sn: u32,
    exp_cmd_sn: u32,
}

impl<'p> Connection<'p> {
    fn new(stream: TcpStream, policy: &'p TargetPolicy, received: Arc<Mutex<Vec<Vec<u8>>>>) -> Self {
        Connection {
            stream,
            policy,
            received,
            stat_sn: 0,
            exp_cmd_sn: 1,
        }
    }

    fn serve(&mut self) -> std::io::Result<()> {
        loop {
            let pdu = match self.read_pdu()? {
                Some(pdu) => pdu,
                None => return Ok(()),
            };

            match pdu.opcode {
                opcode::LOGIN_REQUEST => {
                    if !self.login(&pdu)? {
                        return Ok(());
                    }
                }
                opcode::SCSI_COMMAND => self.command(&pdu)?,
                opcode::LOGOUT_REQUEST => {
                    let mut response = IscsiPdu::new();
                    response.opcode = opcode::LOGOUT_RESPONSE;
                    response.flags = flags::FINAL;
                    response.itt = pdu.itt;
                    self.stamp(&mut response, true);
                    self.write(&response)?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn read_pdu(&mut self) -> std::io::Result<Option<IscsiPdu>> {
        let mut buf = vec![0u8; BHS_SIZE];
        match self.stream.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let dsl = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]) as usize;
        let padded_len = dsl.div_ceil(4) * 4;
        buf.resize(BHS_SIZE + padded_len, 0);
        self.stream.read_exact(&mut buf[BHS_SIZE..])?;

        self.received
            .lock()
            .unwrap()
            .push(buf[..BHS_SIZE + dsl].to_vec());

        Ok(Some(IscsiPdu::from_bytes(&buf).expect("well-formed PDU from client")))
    }

    fn write(&mut self, pdu: &IscsiPdu) -> std::io::Result<()> {
        self.stream.write_all(&pdu.to_bytes())
    }

    /// Fill StatSN/ExpCmdSN/MaxCmdSN (bytes 24-35)
    fn stamp(&mut self, pdu: &mut IscsiPdu, advance_stat_sn: bool) {
        pdu.specific[4..8].copy_from_slice(&self.stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&self.exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&self.exp_cmd_sn.wrapping_add(16).to_be_bytes());
        if advance_stat_sn {
            self.stat_sn = self.stat_sn.wrapping_add(1);
        }
    }

    fn login(&mut self, request: &IscsiPdu) -> std::io::Result<bool> {
        let csg = (request.flags >> 2) & 0x03;
        let nsg = request.flags & 0x03;

        let mut response = IscsiPdu::new();
        response.opcode = opcode::LOGIN_RESPONSE;
        response.itt = request.itt;
        let mut lun = request.lun.to_be_bytes();
        lun[6..8].copy_from_slice(&1u16.to_be_bytes());
        response.lun = u64::from_be_bytes(lun);
        self.exp_cmd_sn = u32::from_be_bytes([
            request.specific[4],
            request.specific[5],
            request.specific[6],
            request.specific[7],
        ]);

        if let Some((class, detail)) = self.policy.login_status {
            response.specific[16] = class;
            response.specific[17] = detail;
            self.stamp(&mut response, true);
            self.write(&response)?;
            return Ok(false);
        }

        response.flags = flags::TRANSIT | (csg << 2) | nsg;
        let keys: Vec<(&str, String)> = if csg == flags::STAGE_LOGIN_OP_NEG {
            let mut keys = vec![
                ("HeaderDigest", "None".to_string()),
                ("DataDigest", "None".to_string()),
                (
                    "MaxRecvDataSegmentLength",
                    self.policy.max_recv_data_segment_length.to_string(),
                ),
                ("MaxBurstLength", self.policy.max_burst_length.to_string()),
                ("FirstBurstLength", self.policy.first_burst_length.to_string()),
            ];
            if let Some(value) = self.policy.immediate_data {
                keys.push(("ImmediateData", value.to_string()));
            }
            if let Some(value) = self.policy.initial_r2t {
                keys.push(("InitialR2T", value.to_string()));
            }
            keys
        } else {
            vec![("TargetPortalGroupTag", "1".to_string())]
        };
        response.data = pdu::serialize_text_parameters(&keys);

        self.stamp(&mut response, true);
        self.write(&response)?;
        Ok(true)
    }

    fn command(&mut self, pdu: &IscsiPdu) -> std::io::Result<()> {
        let command = pdu.parse_scsi_command().expect("SCSI command");
        self.exp_cmd_sn = command.cmd_sn.wrapping_add(1);

        let mut received = pdu.data.clone();
        if command.write && !command.final_flag {
            // Unsolicited Data-Out until F
            loop {
                let data_out = match self.read_pdu()? {
                    Some(pdu) => pdu,
                    None => return Ok(()),
                };
                let data_out = data_out.parse_scsi_data_out().expect("Data-Out");
                received.extend_from_slice(&data_out.data);
                if data_out.final_flag {
                    break;
                }
            }
        }

        let (mut status, mut sense, data_in) = self.execute(&command);

        if command.write && status == scsi_status::GOOD {
            let mut r2t_sn = 0;
            while (received.len() as u32) < command.expected_data_length {
                let offset = received.len() as u32;
                let desired =
                    (command.expected_data_length - offset).min(self.policy.max_burst_length);
                self.r2t(&command, r2t_sn, offset, desired)?;
                r2t_sn += 1;

                loop {
                    let data_out = match self.read_pdu()? {
                        Some(pdu) => pdu,
                        None => return Ok(()),
                    };
                    let data_out = data_out.parse_scsi_data_out().expect("Data-Out");
                    received.extend_from_slice(&data_out.data);
                    if data_out.final_flag {
                        break;
                    }
                }
            }
        }

        if command.write
            && status == scsi_status::GOOD
            && received.len() as u64 != u64::from(command.expected_data_length)
        {
            status = scsi_status::CHECK_CONDITION;
            sense = Some(length_mismatch());
        }

        if self.policy.ping_before_status {
            let mut ping = IscsiPdu::new();
            ping.opcode = opcode::NOP_IN;
            ping.flags = flags::FINAL;
            ping.itt = RESERVED_TAG;
            ping.specific[0..4].copy_from_slice(&0x0000_0777u32.to_be_bytes());
            self.stamp(&mut ping, false);
            self.write(&ping)?;
            // NOP-Out reply
            self.read_pdu()?;
        }

        match data_in {
            Some(mut data) if status == scsi_status::GOOD => {
                data.truncate(command.expected_data_length as usize);
                let mut response = IscsiPdu::new();
                response.opcode = opcode::SCSI_DATA_IN;
                response.flags = flags::FINAL | flags::STATUS;
                response.opcode_specific = [0, scsi_status::GOOD];
                response.itt = command.itt;
                response.specific[0..4].copy_from_slice(&RESERVED_TAG.to_be_bytes());
                self.stamp(&mut response, true);
                response.data = data;
                self.write(&response)
            }
            _ => {
                let mut response = IscsiPdu::new();
                response.opcode = opcode::SCSI_RESPONSE;
                response.flags = flags::FINAL;
                response.opcode_specific = [0, status];
                response.itt = command.itt;
                self.stamp(&mut response, true);
                if let Some(sense) = sense {
                    let bytes = sense.to_bytes();
                    let mut data = (bytes.len() as u16).to_be_bytes().to_vec();
                    data.extend_from_slice(&bytes);
                    response.data = data;
                }
                self.write(&response)
            }
        }
    }

    fn r2t(
        &mut self,
        command: &pdu::ScsiCommandPdu,
        r2t_sn: u32,
        offset: u32,
        desired: u32,
    ) -> std::io::Result<()> {
        let mut r2t = IscsiPdu::new();
        r2t.opcode = opcode::R2T;
        r2t.flags = flags::FINAL;
        r2t.lun = command.lun;
        r2t.itt = command.itt;
        r2t.specific[0..4].copy_from_slice(&TARGET_TTT.to_be_bytes());
        self.stamp(&mut r2t, false);
        r2t.specific[16..20].copy_from_slice(&r2t_sn.to_be_bytes());
        r2t.specific[20..24].copy_from_slice(&offset.to_be_bytes());
        r2t.specific[24..28].copy_from_slice(&desired.to_be_bytes());
        self.write(&r2t)
    }

    /// Bytes a write CDB says will follow, at this target's block size
    fn write_length(&self, cdb: &[u8; 16]) -> Option<u64> {
        let blocks = match cdb[0] {
            0x2A => u64::from(u16::from_be_bytes([cdb[7], cdb[8]])),
            0xAA => u64::from(u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]])),
            0x8A => u64::from(u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]])),
            // one block of data whatever the range
            0x93 => 1,
            _ => return None,
        };
        Some(blocks * u64::from(self.policy.block_size))
    }

    /// Status, sense and Data-In for a command
    fn execute(&self, command: &pdu::ScsiCommandPdu) -> Answer {
        let answer = self.answer(&command.cdb);
        let unsupported = answer.1.as_ref().map_or(false, |s| s.is_invalid_command());
        match self.write_length(&command.cdb) {
            Some(expected)
                if !unsupported && expected != u64::from(command.expected_data_length) =>
            {
                log::debug!(
                    "CDB transfer length is {} bytes but EDTL is {}",
                    expected,
                    command.expected_data_length
                );
                (scsi_status::CHECK_CONDITION, Some(length_mismatch()), None)
            }
            _ => answer,
        }
    }

    fn answer(&self, cdb: &[u8; 16]) -> Answer {
        let check = |sense: SenseData| -> Answer { (scsi_status::CHECK_CONDITION, Some(sense), None) };
        let good: Answer = (scsi_status::GOOD, None, None);

        match cdb[0] {
            0x2A | 0x8A => good,
            0xAA if self.policy.write12_supported => good,
            0x93 if self.policy.write_same16_supported => {
                let wrprotect = cdb[1] >> 5;
                let protected = self.policy.protect && self.policy.prot_en;
                if wrprotect != 0 && !protected && !self.policy.ignore_wrprotect {
                    check(SenseData::invalid_field_in_cdb())
                } else {
                    good
                }
            }
            0x12 => {
                let mut data = vec![0u8; 36];
                data[0] = self.policy.device_type;
                data[2] = 0x05;
                data[3] = 0x02;
                data[4] = 31;
                data[5] = u8::from(self.policy.protect);
                data[8..16].copy_from_slice(b"LOOPBACK");
                data[16..32].copy_from_slice(b"CONFORMANCE DISK");
                data[32..36].copy_from_slice(b"0001");
                (scsi_status::GOOD, None, Some(data))
            }
            0x9E if cdb[1] & 0x1F == 0x10 && self.policy.read_capacity16_supported => {
                let mut data = vec![0u8; 32];
                data[0..8].copy_from_slice(&2047u64.to_be_bytes());
                data[8..12].copy_from_slice(&self.policy.block_size.to_be_bytes());
                data[12] = u8::from(self.policy.prot_en);
                (scsi_status::GOOD, None, Some(data))
            }
            _ => check(SenseData::invalid_command()),
        }
    }
}
