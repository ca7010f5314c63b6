//! Builders for pgoutput messages and COPY frames used across unit tests

use super::messages::ColumnValue;
use crate::utils::binary::XLogRecPtr;

pub const STUDENTS_ID: i32 = 16384;

pub fn text(value: &str) -> ColumnValue {
    ColumnValue::Text(value.as_bytes().to_vec())
}

fn cstring(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

pub fn tuple(buf: &mut Vec<u8>, columns: &[ColumnValue]) {
    buf.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for column in columns {
        match column {
            ColumnValue::Null => buf.push(b'n'),
            ColumnValue::Unchanged => buf.push(b'u'),
            ColumnValue::Text(bytes) | ColumnValue::Binary(bytes) => {
                buf.push(if matches!(column, ColumnValue::Text(_)) { b't' } else { b'b' });
                buf.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
        }
    }
}

pub fn relation(id: i32, namespace: &str, name: &str, identity: u8, columns: &[(&str, u32)]) -> Vec<u8> {
    let mut buf = vec![b'R'];
    buf.extend_from_slice(&id.to_be_bytes());
    cstring(&mut buf, namespace);
    cstring(&mut buf, name);
    buf.push(identity);
    buf.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for (column, oid) in columns {
        buf.push(1);
        cstring(&mut buf, column);
        buf.extend_from_slice(&oid.to_be_bytes());
        buf.extend_from_slice(&(-1i32).to_be_bytes());
    }
    buf
}

/// `public.students (id int4, name text)`
pub fn students_relation() -> Vec<u8> {
    relation(STUDENTS_ID, "public", "students", b'd', &[("id", 23), ("name", 25)])
}

pub fn insert(id: i32, columns: &[ColumnValue]) -> Vec<u8> {
    let mut buf = vec![b'I'];
    buf.extend_from_slice(&id.to_be_bytes());
    buf.push(b'N');
    tuple(&mut buf, columns);
    buf
}

pub fn update(id: i32, old: Option<(u8, &[ColumnValue])>, new: &[ColumnValue]) -> Vec<u8> {
    let mut buf = vec![b'U'];
    buf.extend_from_slice(&id.to_be_bytes());
    if let Some((kind, columns)) = old {
        buf.push(kind);
        tuple(&mut buf, columns);
    }
    buf.push(b'N');
    tuple(&mut buf, new);
    buf
}

pub fn delete(id: i32, key: &[ColumnValue]) -> Vec<u8> {
    let mut buf = vec![b'D'];
    buf.extend_from_slice(&id.to_be_bytes());
    buf.push(b'K');
    tuple(&mut buf, key);
    buf
}

pub fn begin() -> Vec<u8> {
    let mut buf = vec![b'B'];
    buf.extend_from_slice(&0x100u64.to_be_bytes());
    buf.extend_from_slice(&0i64.to_be_bytes());
    buf.extend_from_slice(&1234u32.to_be_bytes());
    buf
}

pub fn commit() -> Vec<u8> {
    let mut buf = vec![b'C', 0];
    buf.extend_from_slice(&0x100u64.to_be_bytes());
    buf.extend_from_slice(&0x200u64.to_be_bytes());
    buf.extend_from_slice(&0i64.to_be_bytes());
    buf
}

pub fn keepalive_frame(wal_end: XLogRecPtr, reply_requested: bool) -> Vec<u8> {
    let mut frame = vec![b'k'];
    frame.extend_from_slice(&wal_end.to_be_bytes());
    frame.extend_from_slice(&0i64.to_be_bytes());
    frame.push(u8::from(reply_requested));
    frame
}

pub fn xlogdata_frame(data_start: XLogRecPtr, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![b'w'];
    frame.extend_from_slice(&data_start.to_be_bytes());
    frame.extend_from_slice(&data_start.to_be_bytes());
    frame.extend_from_slice(&0i64.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
