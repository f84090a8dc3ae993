use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::value::{Params, Properties, Quaternion, Table, Value, Vector3};

pub trait Bytes: Sized {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error>;
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error>;
}

// caps pre-allocation for lengths read off the wire
const MAX_PREALLOC: usize = 256;
/// Deepest nesting of arrays, tables and dicts accepted when decoding.
pub const MAX_DEPTH: usize = 32;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}

fn write_len(writer: &mut impl WriteBytesExt, len: usize) -> Result<(), io::Error> {
    let len = u32::try_from(len).map_err(|_| invalid("length does not fit in u32"))?;
    writer.write_u32::<LittleEndian>(len)
}

fn read_len(reader: &mut impl ReadBytesExt) -> Result<usize, io::Error> {
    Ok(reader.read_u32::<LittleEndian>()? as usize)
}

fn write_str(writer: &mut impl WriteBytesExt, s: &str) -> Result<(), io::Error> {
    write_len(writer, s.len())?;
    writer.write_all(s.as_bytes())
}

fn read_str(reader: &mut impl ReadBytesExt) -> Result<String, io::Error> {
    let len = read_len(reader)?;
    let mut buf = Vec::with_capacity(len.min(MAX_PREALLOC));
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated string"));
    }
    String::from_utf8(buf).map_err(|_| invalid("string is not valid utf-8"))
}

impl Bytes for Vector3 {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_f32::<LittleEndian>(self.x)?;
        writer.write_f32::<LittleEndian>(self.y)?;
        writer.write_f32::<LittleEndian>(self.z)?;
        Ok(())
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            x: reader.read_f32::<LittleEndian>()?,
            y: reader.read_f32::<LittleEndian>()?,
            z: reader.read_f32::<LittleEndian>()?,
        })
    }
}

impl Bytes for Quaternion {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_f32::<LittleEndian>(self.x)?;
        writer.write_f32::<LittleEndian>(self.y)?;
        writer.write_f32::<LittleEndian>(self.z)?;
        writer.write_f32::<LittleEndian>(self.w)?;
        Ok(())
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            x: reader.read_f32::<LittleEndian>()?,
            y: reader.read_f32::<LittleEndian>()?,
            z: reader.read_f32::<LittleEndian>()?,
            w: reader.read_f32::<LittleEndian>()?,
        })
    }
}

impl Value {
    const NULL: u8 = 0;
    const BOOL: u8 = 1;
    const BYTE: u8 = 2;
    const SHORT: u8 = 3;
    const INT: u8 = 4;
    const LONG: u8 = 5;
    const FLOAT: u8 = 6;
    const DOUBLE: u8 = 7;
    const STRING: u8 = 8;
    const VECTOR3: u8 = 9;
    const QUATERNION: u8 = 10;
    const ARRAY: u8 = 11;
    const INT_ARRAY: u8 = 12;
    const TABLE: u8 = 13;
    const DICT: u8 = 14;
    const CUSTOM: u8 = 15;

    fn type_code(&self) -> u8 {
        match self {
            Value::Null => Self::NULL,
            Value::Bool(_) => Self::BOOL,
            Value::Byte(_) => Self::BYTE,
            Value::Short(_) => Self::SHORT,
            Value::Int(_) => Self::INT,
            Value::Long(_) => Self::LONG,
            Value::Float(_) => Self::FLOAT,
            Value::Double(_) => Self::DOUBLE,
            Value::String(_) => Self::STRING,
            Value::Vector3(_) => Self::VECTOR3,
            Value::Quaternion(_) => Self::QUATERNION,
            Value::Array(_) => Self::ARRAY,
            Value::IntArray(_) => Self::INT_ARRAY,
            Value::Table(_) => Self::TABLE,
            Value::Dict(_) => Self::DICT,
            Value::Custom { .. } => Self::CUSTOM,
        }
    }
}

impl Bytes for Value {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u8(self.type_code())?;
        match self {
            Value::Null => {}
            Value::Bool(v) => writer.write_u8(u8::from(*v))?,
            Value::Byte(v) => writer.write_u8(*v)?,
            Value::Short(v) => writer.write_i16::<LittleEndian>(*v)?,
            Value::Int(v) => writer.write_i32::<LittleEndian>(*v)?,
            Value::Long(v) => writer.write_i64::<LittleEndian>(*v)?,
            Value::Float(v) => writer.write_f32::<LittleEndian>(*v)?,
            Value::Double(v) => writer.write_f64::<LittleEndian>(*v)?,
            Value::String(s) => write_str(writer, s)?,
            Value::Vector3(v) => v.write_to(writer)?,
            Value::Quaternion(q) => q.write_to(writer)?,
            Value::Array(items) => {
                write_len(writer, items.len())?;
                for item in items {
                    item.write_to(writer)?;
                }
            }
            Value::IntArray(items) => {
                write_len(writer, items.len())?;
                for item in items {
                    writer.write_i32::<LittleEndian>(*item)?;
                }
            }
            Value::Table(table) => table.write_to(writer)?,
            Value::Dict(dict) => dict.write_to(writer)?,
            Value::Custom { code, data } => {
                writer.write_u8(*code)?;
                write_len(writer, data.len())?;
                writer.write_all(data)?;
            }
        }
        Ok(())
    }

    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        read_value(reader, 0)
    }
}

fn nested(depth: usize) -> Result<usize, io::Error> {
    if depth >= MAX_DEPTH {
        return Err(invalid("values nested too deeply"));
    }
    Ok(depth + 1)
}

fn read_value(reader: &mut impl ReadBytesExt, depth: usize) -> Result<Value, io::Error> {
    let value = match reader.read_u8()? {
        Value::NULL => Value::Null,
        Value::BOOL => Value::Bool(reader.read_u8()? != 0),
        Value::BYTE => Value::Byte(reader.read_u8()?),
        Value::SHORT => Value::Short(reader.read_i16::<LittleEndian>()?),
        Value::INT => Value::Int(reader.read_i32::<LittleEndian>()?),
        Value::LONG => Value::Long(reader.read_i64::<LittleEndian>()?),
        Value::FLOAT => Value::Float(reader.read_f32::<LittleEndian>()?),
        Value::DOUBLE => Value::Double(reader.read_f64::<LittleEndian>()?),
        Value::STRING => Value::String(read_str(reader)?),
        Value::VECTOR3 => Value::Vector3(Vector3::read_from(reader)?),
        Value::QUATERNION => Value::Quaternion(Quaternion::read_from(reader)?),
        Value::ARRAY => {
            let depth = nested(depth)?;
            let len = read_len(reader)?;
            let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));
            for _ in 0..len {
                items.push(read_value(reader, depth)?);
            }
            Value::Array(items)
        }
        Value::INT_ARRAY => {
            let len = read_len(reader)?;
            let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));
            for _ in 0..len {
                items.push(reader.read_i32::<LittleEndian>()?);
            }
            Value::IntArray(items)
        }
        Value::TABLE => Value::Table(read_table(reader, nested(depth)?)?),
        Value::DICT => Value::Dict(read_dict(reader, nested(depth)?)?),
        Value::CUSTOM => {
            let code = reader.read_u8()?;
            let len = read_len(reader)?;
            let mut data = Vec::with_capacity(len.min(MAX_PREALLOC));
            reader.by_ref().take(len as u64).read_to_end(&mut data)?;
            if data.len() != len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated custom value",
                ));
            }
            Value::Custom { code, data }
        }
        other => return Err(invalid(&format!("unknown value type code {other}"))),
    };
    Ok(value)
}

impl Bytes for Table {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        write_len(writer, self.len())?;
        for (key, value) in self {
            writer.write_i16::<LittleEndian>(*key)?;
            value.write_to(writer)?;
        }
        Ok(())
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        read_table(reader, 0)
    }
}

fn read_table(reader: &mut impl ReadBytesExt, depth: usize) -> Result<Table, io::Error> {
    let len = read_len(reader)?;
    let mut table = Table::new();
    for _ in 0..len {
        let key = reader.read_i16::<LittleEndian>()?;
        table.insert(key, read_value(reader, depth)?);
    }
    Ok(table)
}

impl Bytes for Properties {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        write_len(writer, self.len())?;
        for (key, value) in self {
            write_str(writer, key)?;
            value.write_to(writer)?;
        }
        Ok(())
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        read_dict(reader, 0)
    }
}

fn read_dict(reader: &mut impl ReadBytesExt, depth: usize) -> Result<Properties, io::Error> {
    let len = read_len(reader)?;
    let mut dict = Properties::new();
    for _ in 0..len {
        let key = read_str(reader)?;
        dict.insert(key, read_value(reader, depth)?);
    }
    Ok(dict)
}

impl Bytes for Params {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u8(u8::try_from(self.len()).map_err(|_| invalid("too many parameters"))?)?;
        for (code, value) in self {
            writer.write_u8(*code)?;
            value.write_to(writer)?;
        }
        Ok(())
    }
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        let len = reader.read_u8()?;
        let mut params = Params::new();
        for _ in 0..len {
            let code = reader.read_u8()?;
            params.insert(code, Value::read_from(reader)?);
        }
        Ok(params)
    }
}

/// Serializes a value into a fresh buffer.
pub fn to_vec<B: Bytes>(value: &B) -> Result<Vec<u8>, io::Error> {
    let mut buf = Vec::new();
    value.write_to(&mut buf)?;
    Ok(buf)
}

/// Deserializes a value, rejecting trailing bytes.
pub fn from_slice<B: Bytes>(mut buf: &[u8]) -> Result<B, io::Error> {
    let value = B::read_from(&mut buf)?;
    if !buf.is_empty() {
        return Err(invalid("trailing bytes after value"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_payload_survives_encoding() {
        let mut inner = Table::new();
        inner.insert(0, Value::Int(1001));
        inner.insert(
            1,
            Value::Array(vec![
                Value::Vector3(Vector3::new(1.0, 2.0, 3.0)),
                Value::Null,
                Value::Quaternion(Quaternion::IDENTITY),
            ]),
        );
        inner.insert(3, Value::IntArray(vec![1]));
        let mut props = Properties::new();
        props.insert("name".into(), "bob".into());
        props.insert("blob".into(), Value::Custom { code: 9, data: vec![1, 2, 3] });
        let mut params = Params::new();
        params.insert(245, Value::Table(inner));
        params.insert(249, Value::Dict(props));

        let buf = to_vec(&params).unwrap();
        let decoded: Params = from_slice(&buf).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn rejects_unknown_type_code() {
        let err = from_slice::<Value>(&[0xEE]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_truncated_string() {
        let mut buf = to_vec(&Value::from("hello")).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(from_slice::<Value>(&buf).is_err());
    }

    #[test]
    fn rejects_deeply_nested_values() {
        let nest = |depth: usize| {
            let mut value = Value::Null;
            for _ in 0..depth {
                value = Value::Array(vec![value]);
            }
            to_vec(&value).unwrap()
        };
        assert!(from_slice::<Value>(&nest(MAX_DEPTH)).is_ok());
        let err = from_slice::<Value>(&nest(MAX_DEPTH + 1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut buf = Vec::new();
        for _ in 0..100_000 {
            buf.push(Value::ARRAY);
            buf.extend_from_slice(&1u32.to_le_bytes());
        }
        buf.push(Value::NULL);
        assert!(from_slice::<Value>(&buf).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut buf = to_vec(&Value::Int(5)).unwrap();
        buf.push(0);
        assert!(from_slice::<Value>(&buf).is_err());
    }
}
