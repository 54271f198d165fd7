//! A single value in transit between the wire and the value model.

use std::borrow::Cow;

use crate::error::{QueryError, Result};
use crate::protocol::types::{FormatCode, Oid, oid};
use crate::registry::{self, SessionConfig};
use crate::value::Value;

/// One query parameter or column value in transit.
///
/// `bytes` is `None` for SQL NULL. Parameter binds own their buffer; column
/// binds borrow from the response message and must be decoded before the
/// next message overwrites it.
#[derive(Debug)]
pub struct Bind<'a> {
    bytes: Option<Cow<'a, [u8]>>,
    /// Declared type OID
    pub type_oid: Oid,
    /// Transfer format; this driver always uses binary
    pub format: FormatCode,
}

impl<'a> Bind<'a> {
    /// A column value borrowed from a response buffer.
    pub fn from_column(type_oid: Oid, bytes: Option<&'a [u8]>) -> Self {
        Self {
            bytes: bytes.map(Cow::Borrowed),
            type_oid,
            format: FormatCode::Binary,
        }
    }

    /// Encode a caller-supplied value into an owned parameter bind.
    pub fn from_value(value: &Value) -> Result<Bind<'static>, QueryError> {
        let type_oid = natural_oid(value)?;

        if value.is_null() {
            return Ok(Bind {
                bytes: None,
                type_oid,
                format: FormatCode::Binary,
            });
        }

        let codec = registry::lookup(type_oid).ok_or_else(|| {
            QueryError::InvalidUsage(format!("no codec registered for oid {}", type_oid))
        })?;
        let encode = codec.encode.ok_or_else(|| {
            QueryError::InvalidUsage(format!("oid {} has no parameter encoding", type_oid))
        })?;

        let mut buf = Vec::new();
        encode(value, &mut buf)?;

        Ok(Bind {
            bytes: Some(Cow::Owned(buf)),
            type_oid,
            format: FormatCode::Binary,
        })
    }

    /// The raw bytes, or `None` for SQL NULL.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    /// Byte length; NULL carries no bytes.
    pub fn len(&self) -> usize {
        self.bytes.as_deref().map_or(0, <[u8]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if this bind is SQL NULL.
    pub fn is_null(&self) -> bool {
        self.bytes.is_none()
    }

    /// Decode into the value model.
    ///
    /// NULL decodes to [`Value::Null`] regardless of the declared OID;
    /// unrecognized OIDs fall back to a raw-bytes node.
    pub fn decode(&self, config: &SessionConfig) -> Result<Value, QueryError> {
        match self.bytes.as_deref() {
            None => Ok(Value::Null),
            Some(bytes) => registry::decode(config, self.type_oid, bytes),
        }
    }
}

/// The OID a value encodes as when the caller does not name one.
fn natural_oid(value: &Value) -> Result<Oid, QueryError> {
    Ok(match value {
        // Untyped NULL; the server infers from context.
        Value::Null => 0,
        Value::Bool(_) => oid::BOOL,
        Value::Int(_) => oid::INT8,
        Value::Float(_) => oid::FLOAT8,
        Value::Text(_) => oid::TEXT,
        Value::Bytes(_) => oid::BYTEA,
        Value::Array(values) => {
            let (elem_oid, _) = registry::array_element_codec(values)?;
            match elem_oid {
                oid::BOOL => oid::BOOL_ARRAY,
                oid::INT8 => oid::INT8_ARRAY,
                oid::FLOAT8 => oid::FLOAT8_ARRAY,
                _ => oid::TEXT_ARRAY,
            }
        }
        Value::Object(_) => {
            return Err(QueryError::InvalidUsage(
                "nested objects have no wire representation".into(),
            ));
        }
    })
}

/// Encode a parameter list, reporting the OIDs for the Parse message.
pub fn encode_params(params: &[Value]) -> Result<(Vec<Oid>, Vec<Bind<'static>>), QueryError> {
    let mut oids = Vec::with_capacity(params.len());
    let mut binds = Vec::with_capacity(params.len());
    for param in params {
        let bind = Bind::from_value(param)?;
        oids.push(bind.type_oid);
        binds.push(bind);
    }
    Ok((oids, binds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_decodes_to_null_for_any_oid() {
        let config = SessionConfig::default();
        for type_oid in [oid::BOOL, oid::INT4, oid::TEXT, oid::TIMESTAMP, 999_999] {
            let bind = Bind::from_column(type_oid, None);
            assert_eq!(bind.decode(&config).unwrap(), Value::Null);
        }
    }

    #[test]
    fn length_matches_bytes() {
        let bind = Bind::from_column(oid::TEXT, Some(b"abc"));
        assert_eq!(bind.len(), 3);
        assert!(!bind.is_null());

        let null = Bind::from_column(oid::TEXT, None);
        assert_eq!(null.len(), 0);
        assert!(null.is_null());
    }

    #[test]
    fn parameter_encoding_uses_natural_oids() {
        let bind = Bind::from_value(&Value::Int(5)).unwrap();
        assert_eq!(bind.type_oid, oid::INT8);
        assert_eq!(bind.bytes(), Some(&5_i64.to_be_bytes()[..]));

        let bind = Bind::from_value(&Value::Text("x".into())).unwrap();
        assert_eq!(bind.type_oid, oid::TEXT);

        let bind = Bind::from_value(&Value::Null).unwrap();
        assert_eq!(bind.type_oid, 0);
        assert!(bind.is_null());
    }

    #[test]
    fn array_parameter_oid_follows_elements() {
        let bind = Bind::from_value(&Value::Array(vec![Value::Int(1)])).unwrap();
        assert_eq!(bind.type_oid, oid::INT8_ARRAY);

        let bind = Bind::from_value(&Value::Array(vec![])).unwrap();
        assert_eq!(bind.type_oid, oid::TEXT_ARRAY);
    }

    #[test]
    fn object_parameters_rejected() {
        let row = Value::Object(Default::default());
        assert!(Bind::from_value(&row).is_err());
    }

    #[test]
    fn column_round_trip_through_registry() {
        let config = SessionConfig::default();
        let bind = Bind::from_value(&Value::Int(42)).unwrap();
        let owned;
        let column = {
            owned = bind.bytes().map(<[u8]>::to_vec);
            Bind::from_column(bind.type_oid, owned.as_deref())
        };
        assert_eq!(column.decode(&config).unwrap(), Value::Int(42));
    }
}
