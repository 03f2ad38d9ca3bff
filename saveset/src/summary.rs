//! Saveset summary records: who wrote the saveset, with what command, on
//! which machine.

use serde::Serialize;

use crate::subrecord::{sub_records, SubRecordError};
use crate::time::vms_to_unix;

pub const SUMM_END: u16 = 0;
pub const SUMM_SSNAME: u16 = 1;
pub const SUMM_CMDLINE: u16 = 2;
pub const SUMM_COMMENT: u16 = 3;
pub const SUMM_USER: u16 = 4;
pub const SUMM_UID: u16 = 5;
pub const SUMM_CTIME: u16 = 6;
pub const SUMM_OSCODE: u16 = 7;
pub const SUMM_OSVERSION: u16 = 8;
pub const SUMM_NODENAME: u16 = 9;
pub const SUMM_PID: u16 = 10;
pub const SUMM_DEVICE: u16 = 11;
pub const SUMM_BCKVERSION: u16 = 12;
pub const SUMM_BLOCKSIZE: u16 = 13;
pub const SUMM_GROUPSIZE: u16 = 14;
pub const SUMM_BUFFCOUNT: u16 = 15;

pub const OSCODE_VAX: u16 = 0x400;
pub const OSCODE_AXP: u16 = 0x800;

/// String fields are clipped to this many bytes.
const MAX_TEXT: usize = 255;

/// Parsed summary record. Every field is optional; real savesets omit some.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct SavesetSummary {
    pub saveset_name: Option<String>,
    pub command_line: Option<String>,
    pub comment: Option<String>,
    pub user: Option<String>,
    pub uid: Option<u16>,
    pub gid: Option<u16>,
    /// Unix seconds.
    pub created: Option<i64>,
    pub os_code: Option<u16>,
    pub os_version: Option<String>,
    pub node_name: Option<String>,
    pub cpu_pid: Option<u32>,
    pub device: Option<String>,
    pub backup_version: Option<String>,
    pub blocksize: Option<u32>,
    pub group_size: Option<u16>,
    /// The /BUFFER_COUNT the producer was invoked with. Informational: the
    /// block pool sizes its own look-ahead.
    pub buffer_count: Option<u16>,
}

impl SavesetSummary {
    pub fn parse(payload: &[u8]) -> Result<SavesetSummary, SubRecordError> {
        let mut summary = SavesetSummary::default();

        for rec in sub_records(payload)? {
            let rec = rec?;
            let data = rec.data;
            match rec.code {
                SUMM_SSNAME => summary.saveset_name = Some(text(data)),
                SUMM_CMDLINE => summary.command_line = Some(text(data)),
                SUMM_COMMENT => summary.comment = Some(text(data)),
                SUMM_USER => summary.user = Some(text(data)),
                SUMM_UID => {
                    if data.len() >= 4 {
                        summary.uid = Some(u16::from_le_bytes([data[0], data[1]]));
                        summary.gid = Some(u16::from_le_bytes([data[2], data[3]]));
                    }
                }
                SUMM_CTIME => summary.created = vms_to_unix(data),
                SUMM_OSCODE => {
                    if data.len() >= 2 {
                        summary.os_code = Some(u16::from_le_bytes([data[0], data[1]]));
                    }
                }
                SUMM_OSVERSION => summary.os_version = Some(text(data)),
                SUMM_NODENAME => summary.node_name = Some(text(data)),
                SUMM_PID => {
                    if data.len() >= 4 {
                        summary.cpu_pid =
                            Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
                    }
                }
                SUMM_DEVICE => summary.device = Some(text(data)),
                SUMM_BCKVERSION => summary.backup_version = Some(text(data)),
                SUMM_BLOCKSIZE => {
                    if data.len() >= 4 {
                        summary.blocksize =
                            Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
                    }
                }
                SUMM_GROUPSIZE => {
                    if data.len() >= 2 {
                        summary.group_size = Some(u16::from_le_bytes([data[0], data[1]]));
                    }
                }
                SUMM_BUFFCOUNT => {
                    if data.len() >= 2 {
                        summary.buffer_count = Some(u16::from_le_bytes([data[0], data[1]]));
                    }
                }
                code => {
                    log::warn!(
                        "summary record type {} ({} bytes) undefined",
                        code,
                        data.len()
                    );
                }
            }
        }
        Ok(summary)
    }

    /// Human-readable operating system name.
    pub fn os_name(&self) -> Option<&'static str> {
        match self.os_code {
            Some(OSCODE_VAX) => Some("VAX/VMS"),
            Some(OSCODE_AXP) => Some("AXP/VMS"),
            Some(_) => Some("unknown"),
            None => None,
        }
    }
}

fn text(data: &[u8]) -> String {
    let clip = data.len().min(MAX_TEXT);
    data[..clip]
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}
