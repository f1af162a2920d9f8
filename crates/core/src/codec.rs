//! Wire encoding shared with the simulation engine.
//!
//! A command is one multipart message: frame 0 is the UTF-8 command token,
//! and each argument occupies one further frame holding a single msgpack
//! value. Replies are single-frame, either raw bytes (status tokens) or one
//! msgpack value, depending on the command.

use std::io::Cursor;

use crate::error::SerializationError;

/// The typed values that cross the wire.
///
/// Exactly the shapes both sides agree on: integers, floats, booleans,
/// strings, sequences, and string-keyed maps. Maps are kept as ordered pair
/// vectors because entry order is significant on the wire. Values must
/// round-trip bit-exactly through msgpack.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Seq(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn to_msgpack(&self) -> rmpv::Value {
        match self {
            Value::Int(v) => rmpv::Value::from(*v),
            Value::Float(v) => rmpv::Value::F64(*v),
            Value::Bool(v) => rmpv::Value::Boolean(*v),
            Value::Str(s) => rmpv::Value::String(s.as_str().into()),
            Value::Seq(items) => {
                rmpv::Value::Array(items.iter().map(Value::to_msgpack).collect())
            }
            Value::Map(entries) => rmpv::Value::Map(
                entries
                    .iter()
                    .map(|(key, value)| {
                        (rmpv::Value::String(key.as_str().into()), value.to_msgpack())
                    })
                    .collect(),
            ),
        }
    }

    fn from_msgpack(value: rmpv::Value) -> Result<Self, SerializationError> {
        use rmpv::Value as Mp;
        match value {
            Mp::Integer(n) => match n.as_i64() {
                Some(v) => Ok(Value::Int(v)),
                None => Err(SerializationError::IntRange(n.as_u64().unwrap_or(u64::MAX))),
            },
            Mp::F32(v) => Ok(Value::Float(f64::from(v))),
            Mp::F64(v) => Ok(Value::Float(v)),
            Mp::Boolean(v) => Ok(Value::Bool(v)),
            Mp::String(s) => s
                .into_str()
                .map(Value::Str)
                .ok_or_else(|| SerializationError::Unsupported("non-UTF-8 string".to_owned())),
            Mp::Array(items) => items
                .into_iter()
                .map(Value::from_msgpack)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Seq),
            Mp::Map(entries) => entries
                .into_iter()
                .map(|(key, value)| {
                    let key = match key {
                        Mp::String(s) => s.into_str().ok_or_else(|| {
                            SerializationError::Unsupported("non-UTF-8 map key".to_owned())
                        }),
                        other => Err(SerializationError::Unsupported(format!(
                            "non-string map key: {other:?}"
                        ))),
                    }?;
                    Ok((key, Value::from_msgpack(value)?))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Map),
            // The engine answers clock queries with the msgpack timestamp
            // extension; the value model folds it to unix epoch seconds.
            Mp::Ext(TIMESTAMP_EXT, data) => timestamp_seconds(&data).map(Value::Int),
            other => Err(SerializationError::Unsupported(format!("{other:?}"))),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

const TIMESTAMP_EXT: i8 = -1;

fn timestamp_seconds(data: &[u8]) -> Result<i64, SerializationError> {
    match *data {
        // timestamp32: seconds only
        [a, b, c, d] => Ok(i64::from(u32::from_be_bytes([a, b, c, d]))),
        // timestamp64: 30-bit nanos, 34-bit seconds
        [a, b, c, d, e, f, g, h] => {
            let raw = u64::from_be_bytes([a, b, c, d, e, f, g, h]);
            Ok((raw & 0x3_ffff_ffff) as i64)
        }
        // timestamp96: 32-bit nanos, then signed 64-bit seconds
        [_, _, _, _, a, b, c, d, e, f, g, h] => {
            Ok(i64::from_be_bytes([a, b, c, d, e, f, g, h]))
        }
        _ => Err(SerializationError::Unsupported(format!(
            "timestamp ext with {} bytes",
            data.len()
        ))),
    }
}

/// Serializes one value with the shared encoding.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, SerializationError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value.to_msgpack())?;
    Ok(buf)
}

/// Deserializes one value with the shared encoding.
pub fn read_value(bytes: &[u8]) -> Result<Value, SerializationError> {
    let value = rmpv::decode::read_value(&mut Cursor::new(bytes))?;
    Value::from_msgpack(value)
}

/// Builds the frames for one command: the token, then one frame per arg.
/// No argument frames are emitted for an empty arg list.
pub fn encode_command(token: &str, args: &[Value]) -> Result<Vec<Vec<u8>>, SerializationError> {
    let mut frames = Vec::with_capacity(1 + args.len());
    frames.push(token.as_bytes().to_vec());
    for arg in args {
        frames.push(encode_value(arg)?);
    }
    Ok(frames)
}

/// The raw payload of a single-frame reply, unmodified.
pub fn decode_raw(frames: &[Vec<u8>]) -> Result<&[u8], SerializationError> {
    match frames {
        [frame] => Ok(frame.as_slice()),
        _ => Err(SerializationError::FrameCount(frames.len())),
    }
}

/// A single-frame reply parsed as one typed value.
pub fn decode_value(frames: &[Vec<u8>]) -> Result<Value, SerializationError> {
    read_value(decode_raw(frames)?)
}

/// The command token of a received message (frame 0 as UTF-8).
pub fn token_of(frames: &[Vec<u8>]) -> Result<&str, SerializationError> {
    let first = frames
        .first()
        .ok_or(SerializationError::FrameCount(0))?;
    Ok(std::str::from_utf8(first)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let bytes = encode_value(&value).unwrap();
        assert_eq!(read_value(&bytes).unwrap(), value);
    }

    #[test]
    fn representative_values_round_trip() {
        round_trip(Value::Seq(vec![]));
        round_trip(Value::Int(-42));
        round_trip(Value::Float(204200.0));
        round_trip(Value::Bool(true));
        round_trip(Value::Str("càmpo de trigo 🌾".to_owned()));
        round_trip(Value::Map(vec![
            ("amount".to_owned(), Value::Float(1.5)),
            (
                "fields".to_owned(),
                Value::Seq(vec![Value::Int(0), Value::Int(1)]),
            ),
            (
                "nested".to_owned(),
                Value::Map(vec![("ok".to_owned(), Value::Bool(false))]),
            ),
        ]));
    }

    #[test]
    fn map_entry_order_is_preserved() {
        let value = Value::Map(vec![
            ("z".to_owned(), Value::Int(1)),
            ("a".to_owned(), Value::Int(2)),
        ]);
        let bytes = encode_value(&value).unwrap();
        let Value::Map(entries) = read_value(&bytes).unwrap() else {
            panic!("expected a map");
        };
        assert_eq!(entries[0].0, "z");
        assert_eq!(entries[1].0, "a");
    }

    #[test]
    fn command_with_args_has_one_frame_per_arg() {
        let frames =
            encode_command("do", &["applyIrrigation".into(), 204200.0.into()]).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], b"do");
        assert_eq!(read_value(&frames[1]).unwrap(), "applyIrrigation".into());
        assert_eq!(read_value(&frames[2]).unwrap(), 204200.0.into());
    }

    #[test]
    fn command_without_args_is_a_single_frame() {
        let frames = encode_command("resume", &[]).unwrap();
        assert_eq!(frames, vec![b"resume".to_vec()]);
    }

    #[test]
    fn raw_decode_requires_exactly_one_frame() {
        assert_eq!(decode_raw(&[b"paused".to_vec()]).unwrap(), b"paused");
        assert!(matches!(
            decode_raw(&[]),
            Err(SerializationError::FrameCount(0))
        ));
        assert!(matches!(
            decode_raw(&[vec![], vec![]]),
            Err(SerializationError::FrameCount(2))
        ));
    }

    #[test]
    fn timestamp_ext_decodes_to_unix_seconds() {
        // timestamp32
        let secs: u32 = 1_700_000_000;
        let mut frame = vec![0xd6, 0xff];
        frame.extend_from_slice(&secs.to_be_bytes());
        assert_eq!(read_value(&frame).unwrap(), Value::Int(1_700_000_000));

        // timestamp64 with nanoseconds set
        let raw = (123u64 << 34) | 1_700_000_000;
        let mut frame = vec![0xd7, 0xff];
        frame.extend_from_slice(&raw.to_be_bytes());
        assert_eq!(read_value(&frame).unwrap(), Value::Int(1_700_000_000));

        // timestamp96
        let mut frame = vec![0xc7, 12, 0xff];
        frame.extend_from_slice(&500u32.to_be_bytes());
        frame.extend_from_slice(&(-1i64).to_be_bytes());
        assert_eq!(read_value(&frame).unwrap(), Value::Int(-1));
    }

    #[test]
    fn nil_is_rejected() {
        // 0xc0 is msgpack nil, which has no counterpart in the value model
        assert!(matches!(
            read_value(&[0xc0]),
            Err(SerializationError::Unsupported(_))
        ));
    }

    #[test]
    fn out_of_range_unsigned_is_rejected() {
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &rmpv::Value::from(u64::MAX)).unwrap();
        assert!(matches!(
            read_value(&bytes),
            Err(SerializationError::IntRange(u64::MAX))
        ));
    }

    #[test]
    fn token_of_reads_frame_zero() {
        let frames = encode_command("field", &["Name,CoolField".into()]).unwrap();
        assert_eq!(token_of(&frames).unwrap(), "field");
        assert!(matches!(
            token_of(&[]),
            Err(SerializationError::FrameCount(0))
        ));
    }
}
