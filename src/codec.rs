//! Alignment-aware encoding and decoding of [`Value`]s per signature.
//!
//! All alignment is computed relative to the start of the buffer being
//! encoded into or decoded from. Message bodies are therefore encoded into
//! their own buffer, while headers are built in the message buffer directly.

use crate::error::{ErrorKind, Result};
use crate::proto::{self, Endianness, Type};
use crate::signature::{Signature, TypeView};
use crate::value::{Array, Value};

/// Encode a message body per its signature.
pub(crate) fn encode_body(
    endianness: Endianness,
    signature: &Signature,
    values: &[Value],
) -> Result<Vec<u8>> {
    let expected = signature.iter().count();

    if values.len() != expected {
        return Err(ErrorKind::ArgumentMismatch(
            format!(
                "signature `{signature}` describes {expected} values, got {}",
                values.len()
            )
            .into(),
        )
        .into());
    }

    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf, endianness);

    for (expected, value) in signature.iter().zip(values) {
        enc.write_value(expected, value)?;
    }

    Ok(buf)
}

/// Decode a message body per its signature.
pub(crate) fn decode_body(
    endianness: Endianness,
    signature: &Signature,
    bytes: &[u8],
) -> Result<Vec<Value>> {
    let mut dec = Decoder::new(bytes, endianness);
    let mut values = Vec::new();

    for expected in signature.iter() {
        values.push(dec.read_value(expected)?);
    }

    Ok(values)
}

fn mismatch(expected: &Signature, value: &Value) -> crate::Error {
    ErrorKind::TypeMismatch {
        expected: expected.as_str().into(),
        found: value.kind_name(),
    }
    .into()
}

/// An encoder over a growable buffer.
pub(crate) struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
    endianness: Endianness,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(buf: &'a mut Vec<u8>, endianness: Endianness) -> Self {
        Self { buf, endianness }
    }

    /// The current length of the underlying buffer.
    pub(crate) fn pos(&self) -> usize {
        self.buf.len()
    }

    /// Pad with zero bytes up to the given alignment.
    pub(crate) fn align(&mut self, align: usize) {
        let padding = proto::padding_to(align, self.buf.len());

        for _ in 0..padding {
            self.buf.push(0);
        }
    }

    pub(crate) fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn write_u16(&mut self, value: u16) {
        match self.endianness {
            Endianness::BIG => self.buf.extend_from_slice(&value.to_be_bytes()),
            _ => self.buf.extend_from_slice(&value.to_le_bytes()),
        }
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        match self.endianness {
            Endianness::BIG => self.buf.extend_from_slice(&value.to_be_bytes()),
            _ => self.buf.extend_from_slice(&value.to_le_bytes()),
        }
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        match self.endianness {
            Endianness::BIG => self.buf.extend_from_slice(&value.to_be_bytes()),
            _ => self.buf.extend_from_slice(&value.to_le_bytes()),
        }
    }

    /// Patch a previously written `u32` at the given position.
    pub(crate) fn write_u32_at(&mut self, at: usize, value: u32) {
        let bytes = match self.endianness {
            Endianness::BIG => value.to_be_bytes(),
            _ => value.to_le_bytes(),
        };

        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    /// Write a string with its `u32` length prefix and NUL terminator. The
    /// caller is responsible for 4-byte alignment.
    pub(crate) fn write_str(&mut self, string: &str) {
        self.write_u32(string.len() as u32);
        self.buf.extend_from_slice(string.as_bytes());
        self.buf.push(0);
    }

    /// Write a signature with its `u8` length prefix and NUL terminator.
    pub(crate) fn write_signature(&mut self, signature: &Signature) {
        self.buf.push(signature.len() as u8);
        self.buf.extend_from_slice(signature.as_bytes());
        self.buf.push(0);
    }

    /// Write a value per a single complete type signature.
    pub(crate) fn write_value(&mut self, expected: &Signature, value: &Value) -> Result<()> {
        let Some((view, _)) = expected.split_first() else {
            return Err(mismatch(expected, value));
        };

        match (view, value) {
            (TypeView::Basic(Type::BYTE), Value::Byte(v)) => {
                self.write_u8(*v);
            }
            (TypeView::Basic(Type::BOOLEAN), Value::Bool(v)) => {
                self.align(4);
                self.write_u32(u32::from(*v));
            }
            (TypeView::Basic(Type::INT16), Value::Int16(v)) => {
                self.align(2);
                self.write_u16(*v as u16);
            }
            (TypeView::Basic(Type::UINT16), Value::Uint16(v)) => {
                self.align(2);
                self.write_u16(*v);
            }
            (TypeView::Basic(Type::INT32), Value::Int32(v)) => {
                self.align(4);
                self.write_u32(*v as u32);
            }
            (TypeView::Basic(Type::UINT32), Value::Uint32(v)) => {
                self.align(4);
                self.write_u32(*v);
            }
            (TypeView::Basic(Type::INT64), Value::Int64(v)) => {
                self.align(8);
                self.write_u64(*v as u64);
            }
            (TypeView::Basic(Type::UINT64), Value::Uint64(v)) => {
                self.align(8);
                self.write_u64(*v);
            }
            (TypeView::Basic(Type::DOUBLE), Value::Double(v)) => {
                self.align(8);
                self.write_u64(v.to_bits());
            }
            (TypeView::Basic(Type::STRING), Value::String(v)) => {
                self.align(4);
                self.write_str(v);
            }
            (TypeView::Basic(Type::OBJECT_PATH), Value::ObjectPath(v)) => {
                self.align(4);
                self.write_str(v);
            }
            (TypeView::Basic(Type::SIGNATURE), Value::Signature(v)) => {
                self.write_signature(v);
            }
            (TypeView::Variant, Value::Variant(inner)) => {
                let signature = inner.signature();
                self.write_signature(&signature);
                self.write_value(&signature, inner)?;
            }
            (TypeView::Array(element), Value::Array(array)) => {
                if *array.element() != *element {
                    return Err(mismatch(expected, value));
                }

                self.write_array(element, array.values())?;
            }
            (TypeView::Dict(element, key, v), Value::Array(array)) => {
                if *array.element() != *element {
                    return Err(mismatch(expected, value));
                }

                self.write_dict(element, key, v, array.values())?;
            }
            (TypeView::Struct(fields), Value::Struct(values)) => {
                if fields.iter().count() != values.len() {
                    return Err(mismatch(expected, value));
                }

                self.align(8);

                for (field, value) in fields.iter().zip(values) {
                    self.write_value(field, value)?;
                }
            }
            _ => return Err(mismatch(expected, value)),
        }

        Ok(())
    }

    fn write_array(&mut self, element: &Signature, values: &[Value]) -> Result<()> {
        let (at, start) = self.begin_array(element);

        for value in values {
            self.write_value(element, value)?;
        }

        self.end_array(at, start)
    }

    fn write_dict(
        &mut self,
        element: &Signature,
        key_sig: &Signature,
        value_sig: &Signature,
        entries: &[Value],
    ) -> Result<()> {
        let (at, start) = self.begin_array(element);

        for entry in entries {
            let Value::DictEntry(key, value) = entry else {
                return Err(mismatch(element, entry));
            };

            self.align(8);
            self.write_value(key_sig, key)?;
            self.write_value(value_sig, value)?;
        }

        self.end_array(at, start)
    }

    /// Reserve the array length prefix and pad to the element alignment.
    /// Returns the position of the prefix and the content start offset.
    fn begin_array(&mut self, element: &Signature) -> (usize, usize) {
        self.align(4);
        let at = self.pos();
        self.write_u32(0);
        self.align(Type(element.as_bytes()[0]).alignment());
        (at, self.pos())
    }

    fn end_array(&mut self, at: usize, start: usize) -> Result<()> {
        let length = (self.pos() - start) as u32;

        if length > proto::MAX_ARRAY_LENGTH {
            return Err(ErrorKind::ArrayTooLong(length).into());
        }

        self.write_u32_at(at, length);
        Ok(())
    }
}

/// A decoder over a byte slice with an explicit offset.
pub(crate) struct Decoder<'a> {
    bytes: &'a [u8],
    offset: usize,
    endianness: Endianness,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(bytes: &'a [u8], endianness: Endianness) -> Self {
        Self {
            bytes,
            offset: 0,
            endianness,
        }
    }

    /// The current offset into the underlying bytes.
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(ErrorKind::TruncatedMessage)?;

        let bytes = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Skip over the given number of bytes.
    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n)?;
        Ok(())
    }

    /// Skip padding up to the given alignment.
    pub(crate) fn align(&mut self, align: usize) -> Result<()> {
        let padding = proto::padding_to(align, self.offset);
        self.take(padding)?;
        Ok(())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        let bytes = [bytes[0], bytes[1]];

        Ok(match self.endianness {
            Endianness::BIG => u16::from_be_bytes(bytes),
            _ => u16::from_le_bytes(bytes),
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];

        Ok(match self.endianness {
            Endianness::BIG => u32::from_be_bytes(bytes),
            _ => u32::from_le_bytes(bytes),
        })
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut array = [0; 8];
        array.copy_from_slice(bytes);

        Ok(match self.endianness {
            Endianness::BIG => u64::from_be_bytes(array),
            _ => u64::from_le_bytes(array),
        })
    }

    /// Read a string with its `u32` length prefix and NUL terminator. The
    /// caller is responsible for 4-byte alignment.
    pub(crate) fn read_str(&mut self) -> Result<&'a str> {
        let length = self.read_u32()? as usize;
        let bytes = self.take(length)?;

        if self.take(1)? != [0] {
            return Err(ErrorKind::NotNullTerminated.into());
        }

        Ok(std::str::from_utf8(bytes)?)
    }

    /// Read a signature with its `u8` length prefix and NUL terminator.
    pub(crate) fn read_signature(&mut self) -> Result<&'a Signature> {
        let length = self.read_u8()? as usize;
        let bytes = self.take(length)?;

        if self.take(1)? != [0] {
            return Err(ErrorKind::NotNullTerminated.into());
        }

        let string = std::str::from_utf8(bytes)?;
        crate::signature::validate(string.as_bytes())?;
        Ok(Signature::new_unchecked(string))
    }

    /// Read a value per a single complete type signature.
    pub(crate) fn read_value(&mut self, expected: &Signature) -> Result<Value> {
        let Some((view, _)) = expected.split_first() else {
            return Err(ErrorKind::TruncatedMessage.into());
        };

        let value = match view {
            TypeView::Basic(Type::BYTE) => Value::Byte(self.read_u8()?),
            TypeView::Basic(Type::BOOLEAN) => {
                self.align(4)?;

                match self.read_u32()? {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    other => return Err(ErrorKind::InvalidBoolean(other).into()),
                }
            }
            TypeView::Basic(Type::INT16) => {
                self.align(2)?;
                Value::Int16(self.read_u16()? as i16)
            }
            TypeView::Basic(Type::UINT16) => {
                self.align(2)?;
                Value::Uint16(self.read_u16()?)
            }
            TypeView::Basic(Type::INT32) => {
                self.align(4)?;
                Value::Int32(self.read_u32()? as i32)
            }
            TypeView::Basic(Type::UINT32) => {
                self.align(4)?;
                Value::Uint32(self.read_u32()?)
            }
            TypeView::Basic(Type::INT64) => {
                self.align(8)?;
                Value::Int64(self.read_u64()? as i64)
            }
            TypeView::Basic(Type::UINT64) => {
                self.align(8)?;
                Value::Uint64(self.read_u64()?)
            }
            TypeView::Basic(Type::DOUBLE) => {
                self.align(8)?;
                Value::Double(f64::from_bits(self.read_u64()?))
            }
            TypeView::Basic(Type::STRING) => {
                self.align(4)?;
                Value::String(self.read_str()?.to_owned())
            }
            TypeView::Basic(Type::OBJECT_PATH) => {
                self.align(4)?;
                Value::ObjectPath(self.read_str()?.to_owned())
            }
            TypeView::Basic(Type::SIGNATURE) => {
                Value::Signature(self.read_signature()?.to_owned())
            }
            TypeView::Variant => {
                let signature = self.read_signature()?;

                if signature.iter().count() != 1 {
                    return Err(ErrorKind::TypeMismatch {
                        expected: "a single complete type".into(),
                        found: "variant signature",
                    }
                    .into());
                }

                Value::Variant(Box::new(self.read_value(signature)?))
            }
            TypeView::Array(element) => {
                let end = self.begin_array(element)?;
                let mut array = Array::new(element);

                while self.offset < end {
                    array.push(self.read_value(element)?);
                }

                self.check_array_end(end)?;
                Value::Array(array)
            }
            TypeView::Dict(element, key_sig, value_sig) => {
                let end = self.begin_array(element)?;
                let mut array = Array::new(element);

                while self.offset < end {
                    self.align(8)?;

                    if self.offset >= end {
                        break;
                    }

                    let key = self.read_value(key_sig)?;
                    let value = self.read_value(value_sig)?;
                    array.push(Value::DictEntry(Box::new(key), Box::new(value)));
                }

                self.check_array_end(end)?;
                Value::Array(array)
            }
            TypeView::Struct(fields) => {
                self.align(8)?;
                let mut values = Vec::new();

                for field in fields.iter() {
                    values.push(self.read_value(field)?);
                }

                Value::Struct(values)
            }
            TypeView::Basic(..) => {
                // Remaining basic code is UNIX_FD, which is not carried.
                return Err(ErrorKind::TypeMismatch {
                    expected: expected.as_str().into(),
                    found: "unsupported type code",
                }
                .into());
            }
        };

        Ok(value)
    }

    /// Read the array length prefix and element padding, returning the
    /// offset at which the array contents end.
    fn begin_array(&mut self, element: &Signature) -> Result<usize> {
        self.align(4)?;
        let length = self.read_u32()?;

        if length > proto::MAX_ARRAY_LENGTH {
            return Err(ErrorKind::ArrayTooLong(length).into());
        }

        self.align(Type(element.as_bytes()[0]).alignment())?;
        let end = self.offset + length as usize;

        if end > self.bytes.len() {
            return Err(ErrorKind::TruncatedMessage.into());
        }

        Ok(end)
    }

    fn check_array_end(&self, end: usize) -> Result<()> {
        if self.offset != end {
            return Err(ErrorKind::TruncatedMessage.into());
        }

        Ok(())
    }
}
