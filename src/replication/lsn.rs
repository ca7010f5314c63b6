//! LSN (Log Sequence Number) text form helpers

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::utils::binary::XLogRecPtr;

/// Parse an LSN from its "X/Y" form
pub fn parse_lsn(lsn: &str) -> ReplicationResult<XLogRecPtr> {
    let invalid = || ReplicationError::invalid_argument(format!("Invalid LSN: '{}'", lsn));

    let (high, low) = lsn.trim().split_once('/').ok_or_else(invalid)?;
    if high.is_empty() || low.is_empty() || high.len() > 8 || low.len() > 8 {
        return Err(invalid());
    }

    let high = u64::from_str_radix(high, 16).map_err(|_| invalid())?;
    let low = u64::from_str_radix(low, 16).map_err(|_| invalid())?;

    Ok((high << 32) | low)
}

/// Format an LSN as upper-case "X/Y"
pub fn format_lsn(lsn: XLogRecPtr) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}
