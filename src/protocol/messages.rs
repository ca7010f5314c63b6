//! PostgreSQL logical replication protocol messages
//!
//! Frame types exchanged on the COPY-both stream, and the decoded form of
//! pgoutput change messages.

use super::buffer::BufferWriter;
use super::cursor::{Cursor, RawBytes};
use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::utils::binary::{TimestampTz, XLogRecPtr};
use serde::Serialize;
use std::collections::BTreeMap;

pub const KEEPALIVE_TAG: u8 = b'k';
pub const XLOG_DATA_TAG: u8 = b'w';
pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

/// Tag plus server WAL end, server time and reply flag
pub const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
/// Tag plus start LSN, end LSN and send time
pub const XLOG_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;
/// Tag, three LSNs, client time, reply flag
pub const STANDBY_STATUS_UPDATE_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Primary keepalive message (`'k'`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveMessage {
    pub wal_end: XLogRecPtr,
    pub server_time: TimestampTz,
    pub reply_requested: bool,
}

impl TryFrom<&[u8]> for KeepaliveMessage {
    type Error = ReplicationError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        if data.len() < KEEPALIVE_LEN {
            return Err(ReplicationError::truncated(KEEPALIVE_LEN, 0, data.len()));
        }

        let mut reader = Cursor::<RawBytes>::new(data);
        let tag = reader.read_u8()?;
        if tag != KEEPALIVE_TAG {
            return Err(ReplicationError::protocol(format!(
                "Expected keepalive tag, got '{}'",
                tag as char
            )));
        }

        Ok(KeepaliveMessage {
            wal_end: reader.read_u64()?,
            server_time: reader.read_i64()?,
            reply_requested: reader.read_u8()? != 0,
        })
    }
}

/// WAL data message (`'w'`) carrying one pgoutput message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogDataMessage<'a> {
    pub data_start: XLogRecPtr,
    pub wal_end: XLogRecPtr,
    pub send_time: TimestampTz,
    pub payload: &'a [u8],
}

impl<'a> TryFrom<&'a [u8]> for XLogDataMessage<'a> {
    type Error = ReplicationError;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        let mut reader = Cursor::<RawBytes>::new(data);
        let tag = reader.read_u8()?;
        if tag != XLOG_DATA_TAG {
            return Err(ReplicationError::protocol(format!(
                "Expected XLogData tag, got '{}'",
                tag as char
            )));
        }

        let data_start = reader.read_u64()?;
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_i64()?;

        Ok(XLogDataMessage {
            data_start,
            wal_end,
            send_time,
            payload: &data[XLOG_DATA_HEADER_LEN..],
        })
    }
}

/// Standby status update (`'r'`) sent back to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub received_lsn: XLogRecPtr,
    pub flushed_lsn: XLogRecPtr,
    pub applied_lsn: XLogRecPtr,
    pub client_time: TimestampTz,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    pub fn encode(&self) -> ReplicationResult<[u8; STANDBY_STATUS_UPDATE_LEN]> {
        let mut buf = [0u8; STANDBY_STATUS_UPDATE_LEN];
        let written = {
            let mut writer = BufferWriter::new(&mut buf);
            writer.write_u8(STANDBY_STATUS_UPDATE_TAG)?;
            writer.write_u64(self.received_lsn)?;
            writer.write_u64(self.flushed_lsn)?;
            writer.write_u64(self.applied_lsn)?;
            writer.write_i64(self.client_time)?;
            writer.write_u8(u8::from(self.reply_requested))?;
            writer.bytes_written()
        };

        if written != STANDBY_STATUS_UPDATE_LEN {
            return Err(ReplicationError::protocol(
                "Failed to write standby status update",
            ));
        }
        Ok(buf)
    }
}

/// One column of a decoded tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnValue {
    Null,
    /// TOASTed value the server did not resend; the stored value is unchanged
    Unchanged,
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

impl ColumnValue {
    /// Text form of the value, if it carries one
    pub fn as_text(&self) -> Option<String> {
        match self {
            ColumnValue::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, ColumnValue::Text(_) | ColumnValue::Binary(_))
    }
}

/// Control messages that carry no row payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlEvent {
    Begin,
    Commit,
    Relation(i32),
    NotProcessed,
}

/// A decoded pgoutput message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DecodedChange {
    Insert {
        table_id: i32,
        values: Vec<ColumnValue>,
    },
    Update {
        table_id: i32,
        new_values: Vec<ColumnValue>,
        /// Column index to old value; empty when the server sent no old tuple
        old_key_values: BTreeMap<usize, ColumnValue>,
    },
    Delete {
        table_id: i32,
        key_values: Vec<ColumnValue>,
    },
    Control(ControlEvent),
}
