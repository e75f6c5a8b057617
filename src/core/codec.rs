//! Self-describing binary encoding for [`Value`].
//!
//! One tag byte per value, big-endian fixed-width scalars, `u32` length
//! prefixes for variable-size kinds. The format is the sole representation
//! crossing the transport and (base64-wrapped) entering the backing store.
//!
//! Decoding is bounds-checked and depth-limited; a decoded value re-encodes
//! to the identical byte sequence because maps keep insertion order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::error::{Result, ZakuError};
use crate::core::value::{Dtype, Image, Ndarray, Value};

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_MAP: u8 = 0x08;
const TAG_NDARRAY: u8 = 0x10;
const TAG_IMAGE: u8 = 0x11;

/// Nesting limit for lists and maps.
const MAX_DEPTH: usize = 64;

/// Encode a value to a fresh buffer.
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    encode_into(value, &mut buf);
    buf.freeze()
}

/// Encode a value into `buf` without a length prefix.
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Int(i) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*i);
        }
        Value::Float(f) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64(*f);
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            put_len(buf, s.len());
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            put_len(buf, b.len());
            buf.put_slice(b);
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            put_len(buf, items.len());
            for item in items {
                encode_into(item, buf);
            }
        }
        Value::Map(pairs) => {
            buf.put_u8(TAG_MAP);
            put_len(buf, pairs.len());
            for (key, val) in pairs {
                put_len(buf, key.len());
                buf.put_slice(key.as_bytes());
                encode_into(val, buf);
            }
        }
        Value::Ndarray(arr) => {
            buf.put_u8(TAG_NDARRAY);
            buf.put_u8(dtype_tag(arr.dtype));
            buf.put_u8(arr.shape.len() as u8);
            for dim in &arr.shape {
                buf.put_u64(*dim);
            }
            buf.put_u64(arr.data.len() as u64);
            buf.put_slice(&arr.data);
        }
        Value::Image(img) => {
            buf.put_u8(TAG_IMAGE);
            put_len(buf, img.format.len());
            buf.put_slice(img.format.as_bytes());
            match &img.shape {
                Some(shape) => {
                    buf.put_u8(shape.len() as u8);
                    for dim in shape {
                        buf.put_u64(*dim);
                    }
                }
                None => buf.put_u8(0xFF),
            }
            buf.put_u64(img.data.len() as u64);
            buf.put_slice(&img.data);
        }
    }
}

/// Decode exactly one value from `buf`, consuming only its bytes.
pub fn decode(buf: &mut Bytes) -> Result<Value> {
    decode_at(buf, 0)
}

/// Decode one value and reject trailing bytes. Used for whole frames.
pub fn decode_all(mut buf: Bytes) -> Result<Value> {
    let value = decode_at(&mut buf, 0)?;
    if buf.has_remaining() {
        return Err(ZakuError::invalid(format!(
            "{} trailing bytes after value",
            buf.remaining()
        )));
    }
    Ok(value)
}

fn decode_at(buf: &mut Bytes, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(ZakuError::invalid("value nesting too deep"));
    }
    let tag = take_u8(buf)?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            need(buf, 8)?;
            Ok(Value::Int(buf.get_i64()))
        }
        TAG_FLOAT => {
            need(buf, 8)?;
            Ok(Value::Float(buf.get_f64()))
        }
        TAG_STR => {
            let len = take_len(buf)?;
            let raw = take_bytes(buf, len)?;
            let s = String::from_utf8(raw.to_vec())
                .map_err(|_| ZakuError::invalid("string is not valid utf-8"))?;
            Ok(Value::Str(s))
        }
        TAG_BYTES => {
            let len = take_len(buf)?;
            Ok(Value::Bytes(take_bytes(buf, len)?))
        }
        TAG_LIST => {
            let count = take_len(buf)?;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_at(buf, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => {
            let count = take_len(buf)?;
            let mut pairs = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key_len = take_len(buf)?;
                let raw = take_bytes(buf, key_len)?;
                let key = String::from_utf8(raw.to_vec())
                    .map_err(|_| ZakuError::invalid("map key is not valid utf-8"))?;
                let val = decode_at(buf, depth + 1)?;
                pairs.push((key, val));
            }
            Ok(Value::Map(pairs))
        }
        TAG_NDARRAY => {
            let dtype = dtype_from_tag(take_u8(buf)?)?;
            let rank = take_u8(buf)? as usize;
            let mut shape = Vec::with_capacity(rank);
            for _ in 0..rank {
                need(buf, 8)?;
                shape.push(buf.get_u64());
            }
            let data_len = take_u64_len(buf)?;
            let data = take_bytes(buf, data_len)?;
            Ok(Value::Ndarray(Ndarray { dtype, shape, data }))
        }
        TAG_IMAGE => {
            let fmt_len = take_len(buf)?;
            let raw = take_bytes(buf, fmt_len)?;
            let format = String::from_utf8(raw.to_vec())
                .map_err(|_| ZakuError::invalid("image format is not valid utf-8"))?;
            let rank = take_u8(buf)?;
            let shape = if rank == 0xFF {
                None
            } else {
                let mut dims = Vec::with_capacity(rank as usize);
                for _ in 0..rank {
                    need(buf, 8)?;
                    dims.push(buf.get_u64());
                }
                Some(dims)
            };
            let data_len = take_u64_len(buf)?;
            let data = take_bytes(buf, data_len)?;
            Ok(Value::Image(Image {
                format,
                shape,
                data,
            }))
        }
        other => Err(ZakuError::invalid(format!("unknown value tag 0x{other:02x}"))),
    }
}

fn dtype_tag(dtype: Dtype) -> u8 {
    match dtype {
        Dtype::F16 => 0,
        Dtype::F32 => 1,
        Dtype::F64 => 2,
        Dtype::I8 => 3,
        Dtype::I16 => 4,
        Dtype::I32 => 5,
        Dtype::I64 => 6,
        Dtype::U8 => 7,
        Dtype::U16 => 8,
        Dtype::U32 => 9,
        Dtype::U64 => 10,
        Dtype::Bool => 11,
    }
}

fn dtype_from_tag(tag: u8) -> Result<Dtype> {
    Ok(match tag {
        0 => Dtype::F16,
        1 => Dtype::F32,
        2 => Dtype::F64,
        3 => Dtype::I8,
        4 => Dtype::I16,
        5 => Dtype::I32,
        6 => Dtype::I64,
        7 => Dtype::U8,
        8 => Dtype::U16,
        9 => Dtype::U32,
        10 => Dtype::U64,
        11 => Dtype::Bool,
        other => return Err(ZakuError::invalid(format!("unknown dtype tag {other}"))),
    })
}

fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u32(len as u32);
}

fn need(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(ZakuError::invalid("truncated value"));
    }
    Ok(())
}

fn take_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_len(buf: &mut Bytes) -> Result<usize> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    Ok(len)
}

fn take_u64_len(buf: &mut Bytes) -> Result<usize> {
    need(buf, 8)?;
    let len = buf.get_u64();
    if len > usize::MAX as u64 {
        return Err(ZakuError::invalid("length overflows usize"));
    }
    let len = len as usize;
    need(buf, len)?;
    Ok(len)
}

fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    need(buf, len)?;
    Ok(buf.split_to(len))
}
