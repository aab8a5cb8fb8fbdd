//! Image-load record decoding.
//!
//! Kernel image-load records are classic MOF events: a fixed header block
//! whose width depends on the event version and the logger's pointer size,
//! followed by the module path as a NUL-terminated UTF-16 string. This
//! module knows that layout and nothing else; records it cannot account for
//! are rejected with `None` and the session skips them. Loss of one
//! malformed record must never abort tracing.

/// Kernel image-load provider, {2cb15d1d-5fc1-11d2-abe1-00a0c911f518}.
pub const IMAGE_LOAD_PROVIDER: u128 = 0x2cb15d1d_5fc1_11d2_abe1_00a0c911f518;

/// Opcode of an image mapped into a process during the trace. Rundown
/// (DCStart/DCEnd) and unload opcodes are not loads observed inside the
/// scope and do not decode.
pub const OPCODE_IMAGE_LOAD: u8 = 10;

/// Canonical lowercase GUID string from raw GUID fields.
pub fn format_guid(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        data1, data2, data3,
        data4[0], data4[1], data4[2], data4[3],
        data4[4], data4[5], data4[6], data4[7],
    )
}

/// Offset of the `FileName` field in an image-load payload.
///
/// Versions 2 and 3 lay out the same prefix width: two pointer-sized image
/// fields, pid/checksum/timestamp, four bytes of signature/reserved data,
/// a pointer-sized default base and four reserved u32s. Version 1 carries
/// only base/size/pid, version 0 only base/size. Anything newer is unknown
/// and rejected rather than guessed at.
fn file_name_offset(version: u8, pointer_size: usize) -> Option<usize> {
    match version {
        0 => Some(2 * pointer_size),
        1 => Some(2 * pointer_size + 4),
        2 | 3 => Some(3 * pointer_size + 32),
        _ => None,
    }
}

/// Extract the module path from an image-load payload, or `None` when the
/// record does not parse (short payload, unknown version, empty or
/// unterminated string).
pub fn image_load_path(data: &[u8], version: u8, pointer_size: usize) -> Option<String> {
    let offset = file_name_offset(version, pointer_size)?;
    let tail = data.get(offset..)?;

    let mut units = Vec::with_capacity(tail.len() / 2);
    for pair in tail.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    if units.is_empty() {
        return None;
    }
    Some(String::from_utf16_lossy(&units))
}
