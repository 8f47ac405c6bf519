use bucketlift_protocol::PartRecord;

use crate::{MAX_PARTS, TransferError};

/// Splits `[0, total_size)` into consecutive parts of `part_size` bytes.
///
/// The last part may be shorter. An empty source still yields one
/// zero-length part, since object stores refuse to complete an upload
/// without parts.
pub fn plan_parts(total_size: u64, part_size: u64) -> Result<Vec<PartRecord>, TransferError> {
    if part_size == 0 {
        return Err(TransferError::InvalidPartSize("part size must be positive".into()));
    }

    if total_size == 0 {
        return Ok(vec![PartRecord::pending(1, 0, 0)]);
    }

    let count = total_size.div_ceil(part_size);
    let count = u32::try_from(count).map_err(|_| {
        TransferError::InvalidPartSize(format!(
            "{total_size} bytes in parts of {part_size} exceeds the part number range"
        ))
    })?;

    let parts = (0..count)
        .map(|i| {
            let start = u64::from(i) * part_size;
            let end = (start + part_size).min(total_size);
            PartRecord::pending(i + 1, start, end)
        })
        .collect();
    Ok(parts)
}

/// Grows `requested` until `total_size` fits in at most [`MAX_PARTS`] parts.
pub fn fit_part_size(total_size: u64, requested: u64) -> u64 {
    let floor = total_size.div_ceil(MAX_PARTS as u64);
    requested.max(floor).max(1)
}
