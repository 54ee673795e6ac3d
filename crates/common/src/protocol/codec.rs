//! OPC UA Binary primitives: integers, strings, byte strings, node ids, and the
//! empty forms of `ExtensionObject` and `DiagnosticInfo`.
//!
//! Readers take `&mut &[u8]` and advance the slice; writers append to any
//! [`BufMut`].

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

use super::CodecError;

/// Upper bound for any decoded `String` or `ByteString`.
pub const MAX_STRING_LEN: usize = 65_535;

/// 100-nanosecond ticks between 1601-01-01 and 1970-01-01.
const EPOCH_OFFSET_TICKS: i64 = 116_444_736_000_000_000;

/// An OPC UA node id. Only namespace-qualified identifiers are modelled; the
/// expanded form (namespace URI / server index) is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeId {
    Numeric { namespace: u16, id: u32 },
    String { namespace: u16, id: String },
    Guid { namespace: u16, id: [u8; 16] },
    Opaque { namespace: u16, id: Vec<u8> },
}

impl NodeId {
    pub const NULL: NodeId = NodeId::Numeric {
        namespace: 0,
        id: 0,
    };

    /// A numeric node id in namespace 0.
    pub fn numeric(id: u32) -> Self {
        NodeId::Numeric { namespace: 0, id }
    }

    /// The identifier if this is a numeric node id in namespace 0.
    pub fn as_ns0_numeric(&self) -> Option<u32> {
        match self {
            NodeId::Numeric { namespace: 0, id } => Some(*id),
            _ => None,
        }
    }
}

fn ensure(src: &[u8], len: usize) -> Result<(), CodecError> {
    if src.len() < len {
        return Err(CodecError::Truncated {
            needed: len - src.len(),
        });
    }
    Ok(())
}

pub fn read_u8(src: &mut &[u8]) -> Result<u8, CodecError> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

pub fn read_u16(src: &mut &[u8]) -> Result<u16, CodecError> {
    ensure(src, 2)?;
    Ok(src.get_u16_le())
}

pub fn read_u32(src: &mut &[u8]) -> Result<u32, CodecError> {
    ensure(src, 4)?;
    Ok(src.get_u32_le())
}

pub fn read_i32(src: &mut &[u8]) -> Result<i32, CodecError> {
    ensure(src, 4)?;
    Ok(src.get_i32_le())
}

pub fn read_i64(src: &mut &[u8]) -> Result<i64, CodecError> {
    ensure(src, 8)?;
    Ok(src.get_i64_le())
}

/// Read a length-prefixed `ByteString`. A length of `-1` is the null value.
pub fn read_byte_string(
    src: &mut &[u8],
    field: &'static str,
    max: usize,
) -> Result<Option<Vec<u8>>, CodecError> {
    let len = read_i32(src)?;
    if len == -1 {
        return Ok(None);
    }
    if len < -1 {
        return Err(CodecError::InvalidLength(len));
    }
    let len = len as usize;
    if len > max {
        return Err(CodecError::LengthExceeded { field, len, max });
    }
    ensure(src, len)?;
    let value = src[..len].to_vec();
    src.advance(len);
    Ok(Some(value))
}

/// Read a length-prefixed UTF-8 `String`. A length of `-1` is the null value.
pub fn read_string(
    src: &mut &[u8],
    field: &'static str,
    max: usize,
) -> Result<Option<String>, CodecError> {
    match read_byte_string(src, field, max)? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| CodecError::InvalidUtf8),
        None => Ok(None),
    }
}

pub fn write_byte_string(dst: &mut impl BufMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            dst.put_i32_le(bytes.len() as i32);
            dst.put_slice(bytes);
        }
        None => dst.put_i32_le(-1),
    }
}

pub fn write_string(dst: &mut impl BufMut, value: Option<&str>) {
    write_byte_string(dst, value.map(str::as_bytes));
}

pub fn read_node_id(src: &mut &[u8]) -> Result<NodeId, CodecError> {
    let encoding = read_u8(src)?;
    let node_id = match encoding {
        0x00 => NodeId::numeric(u32::from(read_u8(src)?)),
        0x01 => {
            let namespace = u16::from(read_u8(src)?);
            let id = u32::from(read_u16(src)?);
            NodeId::Numeric { namespace, id }
        }
        0x02 => {
            let namespace = read_u16(src)?;
            let id = read_u32(src)?;
            NodeId::Numeric { namespace, id }
        }
        0x03 => {
            let namespace = read_u16(src)?;
            let id = read_string(src, "node id", MAX_STRING_LEN)?.unwrap_or_default();
            NodeId::String { namespace, id }
        }
        0x04 => {
            let namespace = read_u16(src)?;
            ensure(src, 16)?;
            let mut id = [0u8; 16];
            src.copy_to_slice(&mut id);
            NodeId::Guid { namespace, id }
        }
        0x05 => {
            let namespace = read_u16(src)?;
            let id = read_byte_string(src, "node id", MAX_STRING_LEN)?.unwrap_or_default();
            NodeId::Opaque { namespace, id }
        }
        other => return Err(CodecError::NodeIdEncoding(other)),
    };
    Ok(node_id)
}

/// Write a node id using the most compact encoding that fits.
pub fn write_node_id(dst: &mut impl BufMut, node_id: &NodeId) {
    match node_id {
        NodeId::Numeric { namespace: 0, id } if *id <= u32::from(u8::MAX) => {
            dst.put_u8(0x00);
            dst.put_u8(*id as u8);
        }
        NodeId::Numeric { namespace, id }
            if *namespace <= u16::from(u8::MAX) && *id <= u32::from(u16::MAX) =>
        {
            dst.put_u8(0x01);
            dst.put_u8(*namespace as u8);
            dst.put_u16_le(*id as u16);
        }
        NodeId::Numeric { namespace, id } => {
            dst.put_u8(0x02);
            dst.put_u16_le(*namespace);
            dst.put_u32_le(*id);
        }
        NodeId::String { namespace, id } => {
            dst.put_u8(0x03);
            dst.put_u16_le(*namespace);
            write_string(dst, Some(id));
        }
        NodeId::Guid { namespace, id } => {
            dst.put_u8(0x04);
            dst.put_u16_le(*namespace);
            dst.put_slice(id);
        }
        NodeId::Opaque { namespace, id } => {
            dst.put_u8(0x05);
            dst.put_u16_le(*namespace);
            write_byte_string(dst, Some(id));
        }
    }
}

/// Skip an `ExtensionObject`, whatever its body encoding.
pub fn skip_extension_object(src: &mut &[u8]) -> Result<(), CodecError> {
    read_node_id(src)?;
    match read_u8(src)? {
        0x00 => Ok(()),
        0x01 | 0x02 => read_byte_string(src, "extension object", MAX_STRING_LEN).map(|_| ()),
        other => Err(CodecError::InvalidValue {
            field: "extension object encoding",
            value: u32::from(other),
        }),
    }
}

/// Write an `ExtensionObject` with a null type id and no body.
pub fn write_empty_extension_object(dst: &mut impl BufMut) {
    write_node_id(dst, &NodeId::NULL);
    dst.put_u8(0x00);
}

/// Skip a `DiagnosticInfo`, including nested inner diagnostics.
pub fn skip_diagnostic_info(src: &mut &[u8]) -> Result<(), CodecError> {
    let mask = read_u8(src)?;
    for bit in [0x01u8, 0x02, 0x04, 0x08] {
        if mask & bit != 0 {
            read_i32(src)?;
        }
    }
    if mask & 0x10 != 0 {
        read_string(src, "additional info", MAX_STRING_LEN)?;
    }
    if mask & 0x20 != 0 {
        read_u32(src)?;
    }
    if mask & 0x40 != 0 {
        skip_diagnostic_info(src)?;
    }
    Ok(())
}

/// Skip an array of `String`. A length of `-1` is the null array.
pub fn skip_string_array(src: &mut &[u8]) -> Result<(), CodecError> {
    let len = read_i32(src)?;
    if len < -1 {
        return Err(CodecError::InvalidLength(len));
    }
    for _ in 0..len.max(0) {
        read_string(src, "string table", MAX_STRING_LEN)?;
    }
    Ok(())
}

/// Current time as an OPC UA `DateTime` (100 ns ticks since 1601-01-01 UTC).
pub fn date_time_now() -> i64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    EPOCH_OFFSET_TICKS
        + since_unix.as_secs() as i64 * 10_000_000
        + i64::from(since_unix.subsec_nanos() / 100)
}
