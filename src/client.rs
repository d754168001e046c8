//! iSCSI initiator client
//!
//! A small blocking initiator: one TCP connection, one session, one command
//! in flight. It is built for conformance checks, so every operation that
//! sends PDUs accepts an optional [`PduInspector`] that sees the exact bytes
//! of each outgoing PDU before they reach the socket.
//!
//! # Example: one block as unsolicited Data-Out
//!
//! ```no_run
//! use iscsi_conformance::client::IscsiClient;
//! use iscsi_conformance::interceptor::{ValidationReport, Validator};
//! use iscsi_conformance::rules::RuleSet;
//! use iscsi_conformance::scsi::WriteFlags;
//! use iscsi_conformance::session::LoginOptions;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = IscsiClient::connect("127.0.0.1:3260")?;
//! let options = LoginOptions::new(
//!     "iqn.2025-12.local:initiator",
//!     "iqn.2025-12.local:storage.disk1",
//! )
//! .immediate_data(false)
//! .initial_r2t(false);
//! client.login(&options)?;
//!
//! let mut report = ValidationReport::new();
//! let mut validator = Validator::new(RuleSet::unsolicited_non_immediate_data(512), &mut report);
//! let task = client.write10(0, 0, &[0u8; 512], 512, &WriteFlags::default(), Some(&mut validator))?;
//! assert!(report.is_valid() && task.is_good());
//! client.logout()?;
//! # Ok(())
//! # }
//! ```

use byteorder::{BigEndian, ByteOrder};

use crate::error::{IscsiError, ScsiResult};
use crate::header;
use crate::interceptor::{PassThrough, PduInspector, Verdict};
use crate::pdu::{self, flags, logout_reason, opcode, response_code, IscsiPdu, BHS_SIZE, RESERVED_TAG};
use crate::scsi::{self, scsi_status, InquiryData, ReadCapacity16, SenseData, WriteFlags};
use crate::session::{DigestType, LoginOptions, SessionParams};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Read/write timeout applied to the socket by [`IscsiClient::connect`]
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Login Request/Response exchanges allowed per stage before giving up
const MAX_LOGIN_EXCHANGES: usize = 8;

/// Direction and size of the data phase of a command
#[derive(Debug, Clone, Copy)]
pub enum DataTransfer<'a> {
    None,
    /// Data-In of at most this many bytes
    Read(u32),
    /// Data-Out of exactly these bytes
    Write(&'a [u8]),
}

/// Outcome of one SCSI command
#[derive(Debug, Clone)]
pub struct ScsiTask {
    pub itt: u32,
    /// SCSI status byte
    pub status: u8,
    /// iSCSI response code
    pub response: u8,
    pub sense: Option<SenseData>,
    pub data_in: Vec<u8>,
    pub residual: u32,
    /// PDUs written for this command (command, Data-Out, NOP-Out replies)
    pub pdus_sent: usize,
    /// PDUs the inspector rejected; they were still sent
    pub rejected_pdus: usize,
}

impl ScsiTask {
    fn new(itt: u32) -> Self {
        ScsiTask {
            itt,
            status: scsi_status::GOOD,
            response: response_code::COMMAND_COMPLETED,
            sense: None,
            data_in: Vec::new(),
            residual: 0,
            pdus_sent: 0,
            rejected_pdus: 0,
        }
    }

    fn count(&mut self, verdict: Verdict) {
        self.pdus_sent += 1;
        if verdict == Verdict::Reject {
            self.rejected_pdus += 1;
        }
    }

    pub fn is_good(&self) -> bool {
        self.response == response_code::COMMAND_COMPLETED && self.status == scsi_status::GOOD
    }

    /// Human-readable status, with sense when present
    pub fn describe(&self) -> String {
        if self.response != response_code::COMMAND_COMPLETED {
            return format!("iSCSI response 0x{:02x} (target failure)", self.response);
        }
        match &self.sense {
            Some(sense) => format!("{}: {}", scsi::status_name(self.status), sense),
            None => scsi::status_name(self.status).to_string(),
        }
    }
}

/// Encode a LUN for the BHS LUN field (SAM peripheral or flat addressing)
pub fn encode_lun(lun: u16) -> u64 {
    if lun < 256 {
        u64::from(lun) << 48
    } else {
        (0x4000u64 | u64::from(lun & 0x3FFF)) << 48
    }
}

/// iSCSI initiator connection
pub struct IscsiClient {
    stream: TcpStream,
    isid: [u8; 6],
    tsih: u16,
    cid: u16,
    cmd_sn: u32,
    exp_stat_sn: u32,
    max_cmd_sn: u32,
    next_itt: u32,
    params: SessionParams,
    logged_in: bool,
}

impl IscsiClient {
    /// Connect to an iSCSI target at the given address
    ///
    /// # Arguments
    ///
    /// * `addr` - Address and port in format "host:port" (e.g., "127.0.0.1:3260")
    pub fn connect(addr: &str) -> ScsiResult<Self> {
        Self::connect_with_timeout(addr, DEFAULT_IO_TIMEOUT)
    }

    /// Connect with an explicit socket read/write timeout
    pub fn connect_with_timeout(addr: &str, timeout: Duration) -> ScsiResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        // ISID type 0x80 (random) with a random qualifier
        let qualifier: [u8; 3] = rand::random();
        let isid = [0x80, qualifier[0], qualifier[1], qualifier[2], 0x00, 0x00];

        log::debug!("Connected to {} with ISID {}", addr, hex::encode(isid));

        Ok(IscsiClient {
            stream,
            isid,
            tsih: 0,
            cid: 0,
            cmd_sn: 1,
            exp_stat_sn: 0,
            max_cmd_sn: 1,
            next_itt: 1,
            params: SessionParams::default(),
            logged_in: false,
        })
    }

    /// Log in: security stage with AuthMethod=None, then operational
    /// negotiation proposing the keys in `options`.
    ///
    /// Returns the negotiated parameter snapshot.
    pub fn login(&mut self, options: &LoginOptions) -> ScsiResult<SessionParams> {
        if self.logged_in {
            return Err(IscsiError::Session("Already logged in".to_string()));
        }

        let security_keys = vec![
            ("InitiatorName", options.initiator_name.clone()),
            ("TargetName", options.target_name.clone()),
            ("SessionType", "Normal".to_string()),
            ("AuthMethod", "None".to_string()),
        ];
        let security_response = self.login_stage(
            flags::STAGE_SECURITY_NEG,
            flags::STAGE_LOGIN_OP_NEG,
            &security_keys,
        )?;
        log::debug!("Security stage answered {:?}", security_response);

        let operational_response = self.login_stage(
            flags::STAGE_LOGIN_OP_NEG,
            flags::STAGE_FULL_FEATURE,
            &options.operational_keys(),
        )?;

        let params = SessionParams::negotiate(options, &operational_response);
        if params.header_digest != DigestType::None || params.data_digest != DigestType::None {
            return Err(IscsiError::Session(
                "Target selected a CRC32C digest; only None is supported".to_string(),
            ));
        }

        log::info!(
            "Logged in to {} (TSIH {}): ImmediateData={:?} InitialR2T={:?} FirstBurstLength={} MaxRecvDataSegmentLength={}",
            options.target_name,
            self.tsih,
            params.immediate_data,
            params.initial_r2t,
            params.first_burst_length,
            params.target_max_recv_data_segment_length
        );

        self.params = params;
        self.logged_in = true;
        Ok(params)
    }

    /// Run one login stage until the target transits to `nsg`.
    ///
    /// Returns every key the target sent during the stage.
    fn login_stage(
        &mut self,
        csg: u8,
        nsg: u8,
        keys: &[(&str, String)],
    ) -> ScsiResult<Vec<(String, String)>> {
        let itt = self.allocate_itt();
        let mut data = pdu::serialize_text_parameters(keys);
        let mut answered = Vec::new();

        for _ in 0..MAX_LOGIN_EXCHANGES {
            let request = IscsiPdu::login_request(
                self.isid,
                self.tsih,
                self.cid,
                itt,
                self.cmd_sn,
                self.exp_stat_sn,
                csg,
                nsg,
                true,
                std::mem::take(&mut data),
            );
            self.transmit(&request, &mut PassThrough)?;

            let response = self.recv_pdu()?.parse_login_response()?;
            if response.status_class != pdu::login_status::SUCCESS {
                return Err(IscsiError::login(response.status_class, response.status_detail));
            }

            self.tsih = response.tsih;
            self.exp_stat_sn = response.stat_sn.wrapping_add(1);
            self.cmd_sn = response.exp_cmd_sn;
            self.max_cmd_sn = response.max_cmd_sn;
            answered.extend(response.parameters);

            if response.transit && response.nsg == nsg {
                return Ok(answered);
            }
            log::debug!(
                "Login stage {} continues (T={}, NSG={})",
                csg,
                response.transit,
                response.nsg
            );
        }

        Err(IscsiError::Protocol(format!(
            "Target did not leave login stage {} after {} exchanges",
            csg, MAX_LOGIN_EXCHANGES
        )))
    }

    /// Serialize, show to the inspector, then write the PDU.
    ///
    /// A rejected PDU is still written.
    fn transmit(&mut self, pdu: &IscsiPdu, inspector: &mut dyn PduInspector) -> ScsiResult<Verdict> {
        let bytes = pdu.to_bytes();
        let verdict = inspector.inspect(&bytes);
        if verdict == Verdict::Reject {
            log::warn!(
                "Inspector rejected {} ITT=0x{:08x}; sending it anyway",
                pdu.opcode_name(),
                pdu.itt
            );
        }

        log::debug!(
            "-> {} ITT=0x{:08x} F={} DSL={}",
            pdu.opcode_name(),
            pdu.itt,
            u8::from(header::is_final(&bytes)),
            header::data_segment_length(&bytes)
        );
        self.stream.write_all(&bytes)?;
        Ok(verdict)
    }

    /// Send an arbitrary PDU, optionally through an inspector
    pub fn send_pdu(
        &mut self,
        pdu: &IscsiPdu,
        inspector: Option<&mut dyn PduInspector>,
    ) -> ScsiResult<Verdict> {
        match inspector {
            Some(inspector) => self.transmit(pdu, inspector),
            None => self.transmit(pdu, &mut PassThrough),
        }
    }

    /// Receive a PDU from the target
    ///
    /// Reads the 48-byte BHS, then the AHS and padded data segment.
    pub fn recv_pdu(&mut self) -> ScsiResult<IscsiPdu> {
        let mut buf = vec![0u8; BHS_SIZE];
        self.stream.read_exact(&mut buf)?;

        let ahs_len = buf[4] as usize * 4;
        let padded_len = (header::data_segment_length(&buf) as usize).div_ceil(4) * 4;
        let rest = ahs_len + padded_len;
        if rest > 0 {
            buf.resize(BHS_SIZE + rest, 0);
            self.stream.read_exact(&mut buf[BHS_SIZE..])?;
        }

        let pdu = IscsiPdu::from_bytes(&buf)?;
        log::debug!(
            "<- {} ITT=0x{:08x} DSL={}",
            pdu.opcode_name(),
            pdu.itt,
            pdu.data_length
        );
        Ok(pdu)
    }

    /// Execute one SCSI command and wait for its status.
    ///
    /// Write data is framed according to the negotiated parameters:
    /// immediate data when ImmediateData=Yes (bounded by FirstBurstLength and
    /// the target's MaxRecvDataSegmentLength), unsolicited Data-Out up to
    /// FirstBurstLength when InitialR2T=No, and solicited Data-Out for each
    /// R2T. The command PDU's F-bit is cleared when unsolicited Data-Out
    /// follows it.
    pub fn execute(
        &mut self,
        lun: u16,
        cdb: &[u8],
        transfer: DataTransfer<'_>,
        inspector: Option<&mut dyn PduInspector>,
    ) -> ScsiResult<ScsiTask> {
        match inspector {
            Some(inspector) => self.run_task(lun, cdb, transfer, inspector),
            None => self.run_task(lun, cdb, transfer, &mut PassThrough),
        }
    }

    fn run_task(
        &mut self,
        lun: u16,
        cdb: &[u8],
        transfer: DataTransfer<'_>,
        inspector: &mut dyn PduInspector,
    ) -> ScsiResult<ScsiTask> {
        if !self.logged_in {
            return Err(IscsiError::Session(
                "Not logged in. Call login() first.".to_string(),
            ));
        }

        let (read, out, expected_len) = match transfer {
            DataTransfer::None => (false, &[][..], 0u32),
            DataTransfer::Read(len) => (true, &[][..], len),
            DataTransfer::Write(data) => {
                let len = u32::try_from(data.len()).map_err(|_| {
                    IscsiError::Scsi(format!("Write of {} bytes is too large", data.len()))
                })?;
                (false, data, len)
            }
        };
        let write = matches!(transfer, DataTransfer::Write(_));

        let lun = encode_lun(lun);
        let itt = self.allocate_itt();
        let mut task = ScsiTask::new(itt);

        let segment_limit = self
            .params
            .target_max_recv_data_segment_length
            .clamp(1, pdu::MAX_DATA_SEGMENT_LENGTH) as usize;
        let first_burst = self.params.first_burst_length as usize;

        let immediate_len = if write && self.params.immediate_data_enabled() {
            out.len().min(first_burst).min(segment_limit)
        } else {
            0
        };
        let unsolicited_end = if write && !self.params.initial_r2t_required() {
            out.len().min(first_burst).max(immediate_len)
        } else {
            immediate_len
        };

        let command = IscsiPdu::scsi_command(
            lun,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
            expected_len,
            cdb,
            read,
            write,
            unsolicited_end == immediate_len,
            out[..immediate_len].to_vec(),
        )?;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        let verdict = self.transmit(&command, inspector)?;
        task.count(verdict);

        if unsolicited_end > immediate_len {
            self.send_data_sequence(
                lun,
                itt,
                RESERVED_TAG,
                out,
                immediate_len..unsolicited_end,
                inspector,
                &mut task,
            )?;
        }

        loop {
            let pdu = self.recv_pdu()?;
            if pdu.itt != itt && pdu.opcode != opcode::NOP_IN && pdu.opcode != opcode::ASYNC_MESSAGE
            {
                return Err(IscsiError::Protocol(format!(
                    "{} for ITT 0x{:08x} while waiting on 0x{:08x}",
                    pdu.opcode_name(),
                    pdu.itt,
                    itt
                )));
            }

            match pdu.opcode {
                opcode::R2T => {
                    let r2t = pdu.parse_r2t()?;
                    self.max_cmd_sn = r2t.max_cmd_sn;
                    let start = r2t.buffer_offset as usize;
                    let end = start + r2t.desired_length as usize;
                    if !write || end > out.len() {
                        return Err(IscsiError::Protocol(format!(
                            "R2T asks for bytes {}..{} of a {}-byte write",
                            start,
                            end,
                            out.len()
                        )));
                    }
                    log::debug!("R2T #{} for {}..{}", r2t.r2t_sn, start, end);
                    self.send_data_sequence(lun, itt, r2t.ttt, out, start..end, inspector, &mut task)?;
                }
                opcode::SCSI_DATA_IN => {
                    let data_in = pdu.parse_scsi_data_in()?;
                    let start = data_in.buffer_offset as usize;
                    let end = start + data_in.data.len();
                    if end > expected_len as usize {
                        return Err(IscsiError::Protocol(format!(
                            "Data-In for bytes {}..{} exceeds allocation of {}",
                            start, end, expected_len
                        )));
                    }
                    if task.data_in.len() < end {
                        task.data_in.resize(end, 0);
                    }
                    task.data_in[start..end].copy_from_slice(&data_in.data);
                    self.max_cmd_sn = data_in.max_cmd_sn;

                    if let Some(status) = data_in.status {
                        self.exp_stat_sn = data_in.stat_sn.wrapping_add(1);
                        task.status = status;
                        task.residual = data_in.residual_count;
                        return Ok(task);
                    }
                }
                opcode::SCSI_RESPONSE => {
                    let response = pdu.parse_scsi_response()?;
                    self.exp_stat_sn = response.stat_sn.wrapping_add(1);
                    self.max_cmd_sn = response.max_cmd_sn;
                    task.response = response.response;
                    task.status = response.status;
                    task.residual = response.residual_count;
                    if !response.sense.is_empty() {
                        match SenseData::parse(&response.sense) {
                            Ok(sense) => task.sense = Some(sense),
                            Err(e) => log::warn!(
                                "Unparseable sense {}: {}",
                                hex::encode(&response.sense),
                                e
                            ),
                        }
                    }
                    return Ok(task);
                }
                opcode::NOP_IN => {
                    // Bytes 20-23: Target Transfer Tag; RESERVED_TAG means no reply wanted
                    let ttt = BigEndian::read_u32(&pdu.specific[0..4]);
                    if ttt != RESERVED_TAG {
                        let reply =
                            IscsiPdu::nop_out_reply(pdu.lun, ttt, self.cmd_sn, self.exp_stat_sn);
                        let verdict = self.transmit(&reply, inspector)?;
                        task.count(verdict);
                    }
                }
                opcode::ASYNC_MESSAGE => {
                    log::warn!("Ignoring async message (event 0x{:02x})", pdu.specific[16]);
                }
                opcode::REJECT => {
                    let reason = pdu.parse_reject_reason()?;
                    return Err(IscsiError::Protocol(format!(
                        "Target rejected a PDU, reason 0x{:02x}",
                        reason
                    )));
                }
                other => {
                    return Err(IscsiError::InvalidPdu(format!(
                        "Unexpected {} (0x{:02x}) during a SCSI command",
                        pdu::opcode_name(other),
                        other
                    )));
                }
            }
        }
    }

    /// Send bytes `range` of `data` as one Data-Out sequence
    fn send_data_sequence(
        &mut self,
        lun: u64,
        itt: u32,
        ttt: u32,
        data: &[u8],
        range: std::ops::Range<usize>,
        inspector: &mut dyn PduInspector,
        task: &mut ScsiTask,
    ) -> ScsiResult<()> {
        let segment_limit = self
            .params
            .target_max_recv_data_segment_length
            .clamp(1, pdu::MAX_DATA_SEGMENT_LENGTH) as usize;
        let mut offset = range.start;
        let mut data_sn = 0u32;

        while offset < range.end {
            let len = (range.end - offset).min(segment_limit);
            let last = offset + len == range.end;
            let pdu = IscsiPdu::scsi_data_out(
                lun,
                itt,
                ttt,
                self.exp_stat_sn,
                data_sn,
                offset as u32,
                data[offset..offset + len].to_vec(),
                last,
            )?;
            let verdict = self.transmit(&pdu, inspector)?;
            task.count(verdict);

            offset += len;
            data_sn += 1;
        }
        Ok(())
    }

    /// WRITE (10) of `data`, which must be a whole number of blocks
    pub fn write10(
        &mut self,
        lun: u16,
        lba: u32,
        data: &[u8],
        block_size: u32,
        flags: &WriteFlags,
        inspector: Option<&mut dyn PduInspector>,
    ) -> ScsiResult<ScsiTask> {
        let blocks = whole_blocks(data, block_size)?;
        let blocks = u16::try_from(blocks).map_err(|_| {
            IscsiError::Scsi(format!("WRITE10 cannot carry {} blocks", blocks))
        })?;
        let cdb = scsi::write10_cdb(lba, blocks, flags)?;
        self.execute(lun, &cdb, DataTransfer::Write(data), inspector)
    }

    /// Standard INQUIRY
    pub fn inquiry(&mut self, lun: u16) -> ScsiResult<InquiryData> {
        let task = self.execute(lun, &scsi::inquiry_cdb(255), DataTransfer::Read(255), None)?;
        if !task.is_good() {
            return Err(IscsiError::Scsi(format!("INQUIRY failed: {}", task.describe())));
        }
        InquiryData::parse(&task.data_in)
    }

    /// READ CAPACITY (16)
    pub fn read_capacity16(&mut self, lun: u16) -> ScsiResult<ReadCapacity16> {
        let task = self.execute(
            lun,
            &scsi::read_capacity16_cdb(32),
            DataTransfer::Read(32),
            None,
        )?;
        if !task.is_good() {
            return Err(IscsiError::Scsi(format!(
                "READ CAPACITY (16) failed: {}",
                task.describe()
            )));
        }
        ReadCapacity16::parse(&task.data_in)
    }

    /// Perform iSCSI logout (close the session)
    pub fn logout(&mut self) -> ScsiResult<()> {
        let itt = self.allocate_itt();
        let request = IscsiPdu::logout_request(
            itt,
            logout_reason::CLOSE_SESSION,
            self.cid,
            self.cmd_sn,
            self.exp_stat_sn,
        );
        self.transmit(&request, &mut PassThrough)?;

        let response = self.recv_pdu()?;
        let code = response.parse_logout_response()?;
        self.logged_in = false;
        if code != 0 {
            return Err(IscsiError::Session(format!(
                "Logout failed with response 0x{:02x}",
                code
            )));
        }
        Ok(())
    }

    fn allocate_itt(&mut self) -> u32 {
        let itt = self.next_itt;
        self.next_itt = self.next_itt.wrapping_add(1);
        if self.next_itt == RESERVED_TAG {
            self.next_itt = 0;
        }
        itt
    }

    /// Negotiated parameters; defaults until login completes
    pub fn session_params(&self) -> &SessionParams {
        &self.params
    }

    /// Get the current command sequence number
    pub fn cmd_sn(&self) -> u32 {
        self.cmd_sn
    }

    /// Get the current expected status sequence number
    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn
    }

    /// Get the maximum command sequence number from target
    pub fn max_cmd_sn(&self) -> u32 {
        self.max_cmd_sn
    }

    /// Check if client is logged in (in full feature phase)
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }
}

fn whole_blocks(data: &[u8], block_size: u32) -> ScsiResult<u32> {
    if block_size == 0 || data.len() % block_size as usize != 0 {
        return Err(IscsiError::Scsi(format!(
            "{} bytes is not a whole number of {}-byte blocks",
            data.len(),
            block_size
        )));
    }
    u32::try_from(data.len() / block_size as usize)
        .map_err(|_| IscsiError::Scsi(format!("{} bytes is too many blocks", data.len())))
}
