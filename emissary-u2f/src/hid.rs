//! U2FHID framing: messages split into 64-byte reports on an allocated
//! channel.
//!
//! The report I/O itself is behind [`ReportIo`]; the `hidraw` module provides
//! it for Linux hidraw nodes.

use std::io;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::transport::{TokenDevice, TransportError};

pub const REPORT_LEN: usize = 64;

const BROADCAST_CID: u32 = 0xffff_ffff;
const INIT_DATA: usize = REPORT_LEN - 7;
const CONT_DATA: usize = REPORT_LEN - 5;
/// One init packet plus 128 continuation packets.
const MAX_PAYLOAD: usize = INIT_DATA + 128 * CONT_DATA;
const READ_TIMEOUT: Duration = Duration::from_secs(3);

const CMD_MSG: u8 = 0x83;
const CMD_INIT: u8 = 0x86;
const CMD_KEEPALIVE: u8 = 0xbb;
const CMD_ERROR: u8 = 0xbf;

/// Raw report exchange with one HID device.
pub trait ReportIo: Send {
    fn write_report(&mut self, report: &[u8; REPORT_LEN]) -> io::Result<()>;

    /// Read the next input report, failing with `TimedOut` after `timeout`.
    fn read_report(&mut self, timeout: Duration) -> io::Result<[u8; REPORT_LEN]>;
}

fn report_cid(report: &[u8; REPORT_LEN]) -> u32 {
    u32::from_be_bytes([report[0], report[1], report[2], report[3]])
}

/// Split `data` into the init and continuation reports of one command.
pub fn frame(cid: u32, cmd: u8, data: &[u8]) -> Result<Vec<[u8; REPORT_LEN]>, TransportError> {
    if data.len() > MAX_PAYLOAD {
        return Err(TransportError::Other(format!(
            "message of {} bytes exceeds the U2FHID limit",
            data.len()
        )));
    }
    let len = u16::try_from(data.len())
        .map_err(|_| TransportError::Other("message length overflow".into()))?;

    let (head, rest) = data.split_at(data.len().min(INIT_DATA));
    let mut first = [0u8; REPORT_LEN];
    first[..4].copy_from_slice(&cid.to_be_bytes());
    first[4] = cmd;
    first[5..7].copy_from_slice(&len.to_be_bytes());
    first[7..7 + head.len()].copy_from_slice(head);

    let mut reports = vec![first];
    for (seq, chunk) in rest.chunks(CONT_DATA).enumerate() {
        let mut report = [0u8; REPORT_LEN];
        report[..4].copy_from_slice(&cid.to_be_bytes());
        report[4] = u8::try_from(seq)
            .map_err(|_| TransportError::Other("too many continuation packets".into()))?;
        report[5..5 + chunk.len()].copy_from_slice(chunk);
        reports.push(report);
    }
    Ok(reports)
}

/// A U2F token reached over U2FHID.
pub struct U2fHidDevice<R> {
    io: R,
    cid: u32,
}

impl<R: ReportIo> U2fHidDevice<R> {
    /// Allocate a channel on the device.
    pub fn init(io: R) -> Result<Self, TransportError> {
        let mut nonce = [0u8; 8];
        OsRng.fill_bytes(&mut nonce);

        let mut device = Self {
            io,
            cid: BROADCAST_CID,
        };
        device.send(CMD_INIT, &nonce)?;
        // Other hosts' INIT replies share the broadcast channel.
        for _ in 0..8 {
            let reply = device.receive(CMD_INIT)?;
            if reply.len() < 17 || reply[..8] != nonce {
                debug!("ignoring INIT reply for another nonce");
                continue;
            }
            device.cid = u32::from_be_bytes([reply[8], reply[9], reply[10], reply[11]]);
            debug!(cid = device.cid, version = reply[12], "allocated U2FHID channel");
            return Ok(device);
        }
        Err(TransportError::Other("no INIT reply for our nonce".into()))
    }

    pub fn channel(&self) -> u32 {
        self.cid
    }

    fn send(&mut self, cmd: u8, data: &[u8]) -> Result<(), TransportError> {
        for report in frame(self.cid, cmd, data)? {
            self.io.write_report(&report)?;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<[u8; REPORT_LEN], TransportError> {
        Ok(self.io.read_report(READ_TIMEOUT)?)
    }

    fn receive(&mut self, cmd: u8) -> Result<Vec<u8>, TransportError> {
        let (len, mut payload) = loop {
            let report = self.read()?;
            if report_cid(&report) != self.cid {
                continue;
            }
            match report[4] {
                CMD_KEEPALIVE => continue,
                CMD_ERROR => {
                    return Err(TransportError::Other(format!(
                        "U2FHID error {:#04x}",
                        report[7]
                    )));
                }
                c if c == cmd => {
                    let len = usize::from(u16::from_be_bytes([report[5], report[6]]));
                    if len > MAX_PAYLOAD {
                        return Err(TransportError::Other(format!(
                            "U2FHID reply of {len} bytes is too long"
                        )));
                    }
                    break (len, report[7..7 + len.min(INIT_DATA)].to_vec());
                }
                other => {
                    return Err(TransportError::Other(format!(
                        "unexpected U2FHID command {other:#04x}"
                    )));
                }
            }
        };

        let mut seq = 0u8;
        while payload.len() < len {
            let report = self.read()?;
            if report_cid(&report) != self.cid {
                continue;
            }
            if report[4] != seq {
                return Err(TransportError::Other(format!(
                    "U2FHID continuation out of order: expected {seq}, got {}",
                    report[4]
                )));
            }
            seq += 1;
            let take = (len - payload.len()).min(CONT_DATA);
            payload.extend_from_slice(&report[5..5 + take]);
        }
        Ok(payload)
    }
}

impl<R: ReportIo> TokenDevice for U2fHidDevice<R> {
    fn message(&mut self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.send(CMD_MSG, data)?;
        self.receive(CMD_MSG)
    }
}
