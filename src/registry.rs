//! Type registry: OID-keyed binary decode/encode strategies.
//!
//! The registry is populated once at process start and read-only afterwards.
//! It is freely shared across connections; per-connection state (the session
//! configuration) is threaded through every decode call instead of living in
//! a global.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use once_cell::sync::Lazy;

use crate::error::{QueryError, Result};
use crate::protocol::codec::{read_i32, read_u32};
use crate::protocol::types::{Oid, oid};
use crate::value::Value;

/// Server settings fixed at connect time that affect binary decoding.
///
/// Computed once per connection from the reported parameters and cached for
/// the connection's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Whether the server sends timestamps as 64-bit microsecond counts
    /// (`integer_datetimes = on`) or as 64-bit float seconds. Servers since
    /// 8.4 always report `on`, which is also the fallback when unreported.
    pub integer_datetimes: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            integer_datetimes: true,
        }
    }
}

impl SessionConfig {
    /// Best-effort lookup from the server parameter list, falling back to
    /// the defaults rather than failing.
    pub fn from_server_params(params: &[(String, String)]) -> Self {
        let mut config = Self::default();
        for (name, value) in params {
            if name == "integer_datetimes" {
                config.integer_datetimes = value == "on";
            }
        }
        config
    }
}

type DecodeFn = fn(&SessionConfig, &[u8]) -> Result<Value, QueryError>;
type EncodeFn = fn(&Value, &mut Vec<u8>) -> Result<(), QueryError>;

/// One registered type: how to move it between wire bytes and [`Value`].
pub struct TypeCodec {
    /// Fixed byte width, or `None` for variable-width types.
    pub width: Option<usize>,
    /// Pure binary-format decoder.
    pub decode: DecodeFn,
    /// Binary-format encoder, for types that can carry parameters.
    pub encode: Option<EncodeFn>,
}

static REGISTRY: Lazy<HashMap<Oid, TypeCodec>> = Lazy::new(|| {
    let mut map = HashMap::new();

    let mut register = |oid: Oid, width: Option<usize>, decode: DecodeFn, encode: Option<EncodeFn>| {
        map.insert(
            oid,
            TypeCodec {
                width,
                decode,
                encode,
            },
        );
    };

    register(oid::BOOL, Some(1), decode_bool, Some(encode_bool));
    register(oid::BYTEA, None, decode_bytea, Some(encode_bytea));
    register(oid::CHAR, Some(1), decode_text, None);
    register(oid::NAME, None, decode_text, None);
    register(oid::INT2, Some(2), decode_int2, Some(encode_int2));
    register(oid::INT4, Some(4), decode_int4, Some(encode_int4));
    register(oid::INT8, Some(8), decode_int8, Some(encode_int8));
    register(oid::TEXT, None, decode_text, Some(encode_text));
    register(oid::VARCHAR, None, decode_text, Some(encode_text));
    register(oid::BPCHAR, None, decode_text, None);
    register(oid::OID, Some(4), decode_oid, None);
    register(oid::JSON, None, decode_text, None);
    register(oid::JSONB, None, decode_jsonb, None);
    register(oid::FLOAT4, Some(4), decode_float4, Some(encode_float4));
    register(oid::FLOAT8, Some(8), decode_float8, Some(encode_float8));
    register(oid::NUMERIC, None, decode_numeric, None);
    register(oid::UUID, Some(16), decode_uuid, None);
    register(oid::DATE, Some(4), decode_date, None);
    register(oid::TIME, Some(8), decode_time, None);
    register(oid::TIMESTAMP, Some(8), decode_timestamp, None);
    register(oid::TIMESTAMPTZ, Some(8), decode_timestamptz, None);

    for array_oid in [
        oid::BOOL_ARRAY,
        oid::INT2_ARRAY,
        oid::INT4_ARRAY,
        oid::INT8_ARRAY,
        oid::FLOAT4_ARRAY,
        oid::FLOAT8_ARRAY,
        oid::TEXT_ARRAY,
    ] {
        register(array_oid, None, decode_array, Some(encode_array));
    }

    map
});

/// Look up the codec for a type OID.
pub fn lookup(type_oid: Oid) -> Option<&'static TypeCodec> {
    REGISTRY.get(&type_oid)
}

/// Decode one non-NULL column value.
///
/// Unrecognized OIDs decode to a raw-bytes fallback node instead of failing
/// the row.
pub fn decode(config: &SessionConfig, type_oid: Oid, bytes: &[u8]) -> Result<Value, QueryError> {
    match lookup(type_oid) {
        Some(codec) => {
            if let Some(width) = codec.width {
                if bytes.len() != width {
                    return Err(QueryError::BadResponse(format!(
                        "oid {}: expected {} bytes, got {}",
                        type_oid,
                        width,
                        bytes.len()
                    )));
                }
            }
            (codec.decode)(config, bytes)
        }
        None => Ok(Value::Bytes(bytes.to_vec())),
    }
}

// === scalar decoders ===

fn decode_bool(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    Ok(Value::Bool(bytes[0] != 0))
}

fn decode_bytea(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    Ok(Value::Bytes(bytes.to_vec()))
}

fn decode_text(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let s = simdutf8::compat::from_utf8(bytes)
        .map_err(|e| QueryError::BadResponse(format!("invalid UTF-8 in text value: {e}")))?;
    Ok(Value::Text(s.to_string()))
}

fn decode_jsonb(config: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    // jsonb binary format is a 1-byte version tag followed by json text
    match bytes.split_first() {
        Some((&1, rest)) => decode_text(config, rest),
        Some((&version, _)) => Err(QueryError::BadResponse(format!(
            "unsupported jsonb version {version}"
        ))),
        None => Err(QueryError::BadResponse("empty jsonb value".into())),
    }
}

fn decode_int2(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    Ok(Value::Int(i16::from_be_bytes([bytes[0], bytes[1]]) as i64))
}

fn decode_int4(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    Ok(Value::Int(
        i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
    ))
}

fn decode_int8(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(Value::Int(i64::from_be_bytes(arr)))
}

fn decode_oid(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    Ok(Value::Int(
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
    ))
}

fn decode_float4(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    Ok(Value::Float(
        f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
    ))
}

fn decode_float8(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(Value::Float(f64::from_be_bytes(arr)))
}

fn decode_uuid(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let id = uuid::Uuid::from_slice(bytes)
        .map_err(|e| QueryError::BadResponse(format!("invalid uuid: {e}")))?;
    Ok(Value::Text(id.to_string()))
}

// === temporal decoders ===

// Wire epoch is 2000-01-01; microsecond resolution in integer mode.

fn epoch_date() -> Result<NaiveDate, QueryError> {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .ok_or_else(|| QueryError::BadResponse("epoch date out of range".into()))
}

fn be_i64(bytes: &[u8]) -> i64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    i64::from_be_bytes(arr)
}

/// Microseconds since the wire epoch, honoring `integer_datetimes`.
///
/// Returns `None` for the infinity sentinels.
fn timestamp_micros(config: &SessionConfig, bytes: &[u8]) -> Result<Option<i64>, QueryError> {
    if config.integer_datetimes {
        match be_i64(bytes) {
            i64::MAX | i64::MIN => Ok(None),
            micros => Ok(Some(micros)),
        }
    } else {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        let seconds = f64::from_be_bytes(arr);
        if seconds.is_finite() {
            Ok(Some((seconds * 1_000_000.0) as i64))
        } else if seconds.is_nan() {
            Err(QueryError::BadResponse("NaN timestamp".into()))
        } else {
            Ok(None)
        }
    }
}

fn infinity_text(bytes: &[u8], config: &SessionConfig) -> &'static str {
    let negative = if config.integer_datetimes {
        be_i64(bytes) < 0
    } else {
        bytes[0] & 0x80 != 0
    };
    if negative { "-infinity" } else { "infinity" }
}

fn decode_timestamp(config: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let Some(micros) = timestamp_micros(config, bytes)? else {
        return Ok(Value::Text(infinity_text(bytes, config).to_string()));
    };
    let datetime = epoch_date()?
        .and_hms_opt(0, 0, 0)
        .and_then(|dt| dt.checked_add_signed(TimeDelta::microseconds(micros)))
        .ok_or_else(|| QueryError::BadResponse("timestamp out of range".into()))?;
    Ok(Value::Text(
        datetime.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
    ))
}

fn decode_timestamptz(config: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let Some(micros) = timestamp_micros(config, bytes)? else {
        return Ok(Value::Text(infinity_text(bytes, config).to_string()));
    };
    let datetime = epoch_date()?
        .and_hms_opt(0, 0, 0)
        .and_then(|dt| dt.checked_add_signed(TimeDelta::microseconds(micros)))
        .ok_or_else(|| QueryError::BadResponse("timestamptz out of range".into()))?;
    Ok(Value::Text(
        datetime.format("%Y-%m-%d %H:%M:%S%.f+00").to_string(),
    ))
}

fn decode_date(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let days = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    match days {
        i32::MAX => return Ok(Value::Text("infinity".into())),
        i32::MIN => return Ok(Value::Text("-infinity".into())),
        _ => {}
    }
    let date = epoch_date()?
        .checked_add_signed(TimeDelta::days(days as i64))
        .ok_or_else(|| QueryError::BadResponse("date out of range".into()))?;
    Ok(Value::Text(date.format("%Y-%m-%d").to_string()))
}

fn decode_time(config: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let micros = if config.integer_datetimes {
        be_i64(bytes)
    } else {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        (f64::from_be_bytes(arr) * 1_000_000.0) as i64
    };
    let midnight = NaiveTime::from_hms_opt(0, 0, 0)
        .ok_or_else(|| QueryError::BadResponse("midnight out of range".into()))?;
    let (time, _) = midnight.overflowing_add_signed(TimeDelta::microseconds(micros));
    Ok(Value::Text(time.format("%H:%M:%S%.f").to_string()))
}

// === numeric ===

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Decode the NUMERIC binary format to its exact decimal string.
///
/// Binary layout: ndigits, weight, sign, dscale (i16/u16 each), then
/// ndigits base-10000 digits. Rendered without float coercion so arbitrary
/// precision survives.
fn decode_numeric(_: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    if bytes.len() < 8 {
        return Err(QueryError::BadResponse(format!(
            "invalid NUMERIC length: {}",
            bytes.len()
        )));
    }

    let ndigits = i16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let weight = i16::from_be_bytes([bytes[2], bytes[3]]) as i32;
    let sign = u16::from_be_bytes([bytes[4], bytes[5]]);
    let dscale = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;

    match sign {
        NUMERIC_NAN => return Ok(Value::Text("NaN".into())),
        NUMERIC_PINF => return Ok(Value::Text("Infinity".into())),
        NUMERIC_NINF => return Ok(Value::Text("-Infinity".into())),
        _ => {}
    }

    if bytes.len() < 8 + ndigits * 2 {
        return Err(QueryError::BadResponse(format!(
            "invalid NUMERIC length: {} (expected {})",
            bytes.len(),
            8 + ndigits * 2
        )));
    }

    let mut digits = Vec::with_capacity(ndigits);
    for i in 0..ndigits {
        let offset = 8 + i * 2;
        digits.push(i16::from_be_bytes([bytes[offset], bytes[offset + 1]]));
    }

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if ndigits == 0 || weight < 0 {
        out.push('0');
    } else {
        for i in 0..=(weight as usize) {
            let digit = digits.get(i).copied().unwrap_or(0);
            if i == 0 {
                out.push_str(&digit.to_string());
            } else {
                out.push_str(&format!("{:04}", digit));
            }
        }
    }

    if dscale > 0 {
        out.push('.');
        let mut written = 0;
        // zero groups between the decimal point and the first stored digit
        let mut lead_zeros = if weight < -1 {
            ((-1 - weight) * 4) as usize
        } else {
            0
        };
        let mut index = (weight + 1).max(0) as usize;
        while written < dscale {
            if lead_zeros > 0 {
                out.push('0');
                lead_zeros -= 1;
                written += 1;
                continue;
            }
            let digit = digits.get(index).copied().unwrap_or(0);
            for c in format!("{:04}", digit).chars() {
                if written < dscale {
                    out.push(c);
                    written += 1;
                }
            }
            index += 1;
        }
    }

    Ok(Value::Text(out))
}

// === arrays ===

/// Decode the array binary format, recursing per dimension.
fn decode_array(config: &SessionConfig, bytes: &[u8]) -> Result<Value, QueryError> {
    let (ndim, rest) = read_i32(bytes)?;
    let (_has_null, rest) = read_i32(rest)?;
    let (elem_oid, mut rest) = read_u32(rest)?;

    if ndim == 0 {
        return Ok(Value::Array(Vec::new()));
    }
    if !(1..=6).contains(&ndim) {
        return Err(QueryError::BadResponse(format!(
            "array with {} dimensions",
            ndim
        )));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        let (len, r) = read_i32(rest)?;
        let (_lower_bound, r) = read_i32(r)?;
        if len < 0 {
            return Err(QueryError::BadResponse("negative array dimension".into()));
        }
        dims.push(len as usize);
        rest = r;
    }

    let value = decode_array_level(config, elem_oid, &dims, &mut rest)?;
    Ok(value)
}

fn decode_array_level(
    config: &SessionConfig,
    elem_oid: Oid,
    dims: &[usize],
    data: &mut &[u8],
) -> Result<Value, QueryError> {
    let (&len, inner_dims) = match dims.split_first() {
        Some(split) => split,
        None => return Ok(Value::Array(Vec::new())),
    };

    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        if inner_dims.is_empty() {
            let (elem_len, rest) = read_i32(data)?;
            if elem_len < 0 {
                values.push(Value::Null);
                *data = rest;
            } else {
                let (bytes, rest) = crate::protocol::codec::read_bytes(rest, elem_len as usize)?;
                values.push(decode(config, elem_oid, bytes)?);
                *data = rest;
            }
        } else {
            values.push(decode_array_level(config, elem_oid, inner_dims, data)?);
        }
    }
    Ok(Value::Array(values))
}

// === scalar encoders ===

fn mismatch(value: &Value, wanted: &str) -> QueryError {
    QueryError::InvalidUsage(format!("cannot encode {:?} as {}", value, wanted))
}

fn encode_bool(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    match value {
        Value::Bool(b) => {
            buf.push(*b as u8);
            Ok(())
        }
        other => Err(mismatch(other, "bool")),
    }
}

fn encode_int2(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    match value {
        Value::Int(i) => {
            let v = i16::try_from(*i)
                .map_err(|_| QueryError::InvalidUsage(format!("{} overflows int2", i)))?;
            buf.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        other => Err(mismatch(other, "int2")),
    }
}

fn encode_int4(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    match value {
        Value::Int(i) => {
            let v = i32::try_from(*i)
                .map_err(|_| QueryError::InvalidUsage(format!("{} overflows int4", i)))?;
            buf.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        other => Err(mismatch(other, "int4")),
    }
}

fn encode_int8(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    match value {
        Value::Int(i) => {
            buf.extend_from_slice(&i.to_be_bytes());
            Ok(())
        }
        other => Err(mismatch(other, "int8")),
    }
}

fn encode_float4(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    match value {
        Value::Float(f) => {
            buf.extend_from_slice(&(*f as f32).to_be_bytes());
            Ok(())
        }
        other => Err(mismatch(other, "float4")),
    }
}

fn encode_float8(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    match value {
        Value::Float(f) => {
            buf.extend_from_slice(&f.to_be_bytes());
            Ok(())
        }
        other => Err(mismatch(other, "float8")),
    }
}

fn encode_text(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    match value {
        Value::Text(s) => {
            buf.extend_from_slice(s.as_bytes());
            Ok(())
        }
        other => Err(mismatch(other, "text")),
    }
}

fn encode_bytea(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    match value {
        Value::Bytes(b) => {
            buf.extend_from_slice(b);
            Ok(())
        }
        other => Err(mismatch(other, "bytea")),
    }
}

/// The element OID and encoder for a one-dimensional array parameter.
///
/// Elements must be homogeneous scalars; empty and all-NULL arrays are sent
/// as text arrays.
pub(crate) fn array_element_codec(values: &[Value]) -> Result<(Oid, EncodeFn), QueryError> {
    for value in values {
        return Ok(match value {
            Value::Null => continue,
            Value::Bool(_) => (oid::BOOL, encode_bool),
            Value::Int(_) => (oid::INT8, encode_int8),
            Value::Float(_) => (oid::FLOAT8, encode_float8),
            Value::Text(_) => (oid::TEXT, encode_text),
            other => return Err(mismatch(other, "array element")),
        });
    }
    Ok((oid::TEXT, encode_text))
}

fn encode_array(value: &Value, buf: &mut Vec<u8>) -> Result<(), QueryError> {
    let Value::Array(values) = value else {
        return Err(mismatch(value, "array"));
    };

    let (elem_oid, encode_elem) = array_element_codec(values)?;
    let has_null = values.iter().any(Value::is_null);

    buf.extend_from_slice(&1_i32.to_be_bytes()); // ndim
    buf.extend_from_slice(&(has_null as i32).to_be_bytes());
    buf.extend_from_slice(&elem_oid.to_be_bytes());
    buf.extend_from_slice(&(values.len() as i32).to_be_bytes());
    buf.extend_from_slice(&1_i32.to_be_bytes()); // lower bound

    let mut elem_buf = Vec::new();
    for elem in values {
        if elem.is_null() {
            buf.extend_from_slice(&(-1_i32).to_be_bytes());
            continue;
        }
        elem_buf.clear();
        encode_elem(elem, &mut elem_buf)?;
        buf.extend_from_slice(&(elem_buf.len() as i32).to_be_bytes());
        buf.extend_from_slice(&elem_buf);
    }

    Ok(())
}
