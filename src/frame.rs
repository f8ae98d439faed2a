//! Framing and deframing of D-Bus messages.
//!
//! A message on the wire is a 16 byte fixed header, an array of header
//! fields, padding to an 8 byte boundary, and the body. Alignment inside of
//! the header is relative to the start of the message, alignment inside of
//! the body is relative to the start of the body.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::codec::{self, Decoder, Encoder};
use crate::error::{ErrorKind, Result};
use crate::message::{Message, MessageKind};
use crate::proto::{self, Endianness, Field, Flags, MessageType};
use crate::signature::{Signature, SignatureBuf};

/// Frame a message into its native endian wire representation.
pub fn frame_message(message: &Message) -> Result<Vec<u8>> {
    frame_message_with(message, Endianness::NATIVE)
}

/// Frame a message into its wire representation with the given endianness.
pub fn frame_message_with(message: &Message, endianness: Endianness) -> Result<Vec<u8>> {
    let body = codec::encode_body(endianness, &message.signature, &message.body)?;

    if body.len() as u64 > u64::from(proto::MAX_BODY_LENGTH) {
        return Err(ErrorKind::BodyTooLong(body.len() as u32).into());
    }

    let mut buf = Vec::with_capacity(proto::FIXED_HEADER_LENGTH + body.len());
    let mut enc = Encoder::new(&mut buf, endianness);

    let message_type = match &message.kind {
        MessageKind::MethodCall { .. } => MessageType::METHOD_CALL,
        MessageKind::MethodReturn { .. } => MessageType::METHOD_RETURN,
        MessageKind::Error { .. } => MessageType::ERROR,
        MessageKind::Signal { .. } => MessageType::SIGNAL,
    };

    enc.write_u8(endianness.0);
    enc.write_u8(message_type.0);
    enc.write_u8(message.flags.0);
    enc.write_u8(proto::VERSION);
    enc.write_u32(body.len() as u32);
    enc.write_u32(message.serial.get());

    // Length of the header field array, patched below.
    let fields_at = enc.pos();
    enc.write_u32(0);
    let fields_start = enc.pos();

    match &message.kind {
        MessageKind::MethodCall { path, member } => {
            write_str_field(&mut enc, Field::PATH, "o", path);
            write_str_field(&mut enc, Field::MEMBER, "s", member);
        }
        MessageKind::MethodReturn { reply_serial } => {
            write_u32_field(&mut enc, Field::REPLY_SERIAL, reply_serial.get());
        }
        MessageKind::Error {
            error_name,
            reply_serial,
        } => {
            write_str_field(&mut enc, Field::ERROR_NAME, "s", error_name);
            write_u32_field(&mut enc, Field::REPLY_SERIAL, reply_serial.get());
        }
        MessageKind::Signal { path, member } => {
            if message.interface.is_none() {
                return Err(ErrorKind::MalformedHeader("signal without an interface").into());
            }

            write_str_field(&mut enc, Field::PATH, "o", path);
            write_str_field(&mut enc, Field::MEMBER, "s", member);
        }
    }

    if let Some(interface) = &message.interface {
        write_str_field(&mut enc, Field::INTERFACE, "s", interface);
    }

    if let Some(destination) = &message.destination {
        write_str_field(&mut enc, Field::DESTINATION, "s", destination);
    }

    if let Some(sender) = &message.sender {
        write_str_field(&mut enc, Field::SENDER, "s", sender);
    }

    if !message.signature.is_empty() {
        enc.align(8);
        enc.write_u8(Field::SIGNATURE.0);
        enc.write_signature(Signature::new_unchecked("g"));
        enc.write_signature(&message.signature);
    }

    let fields_len = (enc.pos() - fields_start) as u32;

    if fields_len > proto::MAX_BODY_LENGTH {
        return Err(ErrorKind::HeaderTooLong(fields_len).into());
    }

    enc.write_u32_at(fields_at, fields_len);
    enc.align(8);
    enc.write_bytes(&body);
    Ok(buf)
}

fn write_str_field(enc: &mut Encoder<'_>, field: Field, signature: &str, value: &str) {
    enc.align(8);
    enc.write_u8(field.0);
    enc.write_signature(Signature::new_unchecked(signature));
    enc.align(4);
    enc.write_str(value);
}

fn write_u32_field(enc: &mut Encoder<'_>, field: Field, value: u32) {
    enc.align(8);
    enc.write_u8(field.0);
    enc.write_signature(Signature::new_unchecked("u"));
    enc.align(4);
    enc.write_u32(value);
}

/// An incremental deframer.
///
/// Bytes are fed in as they arrive and complete messages are taken out.
/// [`Deframer::next`] never blocks; it returns `None` until a whole message
/// has been buffered.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroU32;
/// use wirebus::{frame_message, Deframer, Message};
///
/// let serial = NonZeroU32::new(1).unwrap();
/// let m = Message::method_call("/", "Ping", serial);
/// let bytes = frame_message(&m)?;
///
/// let mut deframer = Deframer::new();
/// deframer.feed(&bytes[..10]);
/// assert!(deframer.next()?.is_none());
///
/// deframer.feed(&bytes[10..]);
/// assert_eq!(deframer.next()?, Some(m));
/// # Ok::<_, wirebus::Error>(())
/// ```
#[derive(Default)]
pub struct Deframer {
    buf: Vec<u8>,
}

impl Deframer {
    /// Construct a new empty deframer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes received from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete message out of the deframer.
    ///
    /// # Errors
    ///
    /// Errors if the buffered bytes are not a well-formed message, in which
    /// case the stream is beyond recovery since framing has been lost.
    pub fn next(&mut self) -> Result<Option<Message>> {
        loop {
            let Some((total, message)) = self.parse_front()? else {
                return Ok(None);
            };

            self.buf.drain(..total);

            let Some(message) = message else {
                // Unknown message type, skipped.
                continue;
            };

            return Ok(Some(message));
        }
    }

    /// Parse the message at the front of the buffer, if complete. Returns
    /// the total framed length and the message, or `None` for a message of
    /// an unrecognized type.
    fn parse_front(&self) -> Result<Option<(usize, Option<Message>)>> {
        if self.buf.len() < proto::FIXED_HEADER_LENGTH {
            return Ok(None);
        }

        let endianness = match Endianness(self.buf[0]) {
            e @ (Endianness::LITTLE | Endianness::BIG) => e,
            _ => return Err(ErrorKind::MalformedHeader("unknown endianness marker").into()),
        };

        if self.buf[3] != proto::VERSION {
            return Err(ErrorKind::MalformedHeader("unsupported protocol version").into());
        }

        let mut dec = Decoder::new(&self.buf, endianness);
        dec.skip(4)?;
        let body_len = dec.read_u32()?;
        let serial = dec.read_u32()?;
        let fields_len = dec.read_u32()?;

        if body_len > proto::MAX_BODY_LENGTH {
            return Err(ErrorKind::BodyTooLong(body_len).into());
        }

        if fields_len > proto::MAX_BODY_LENGTH {
            return Err(ErrorKind::HeaderTooLong(fields_len).into());
        }

        let fields_end = proto::FIXED_HEADER_LENGTH + fields_len as usize;
        let body_start = fields_end + proto::padding_to(8, fields_end);
        let total = body_start + body_len as usize;

        if self.buf.len() < total {
            return Ok(None);
        }

        let message_type = MessageType(self.buf[1]);

        if !matches!(
            message_type,
            MessageType::METHOD_CALL
                | MessageType::METHOD_RETURN
                | MessageType::ERROR
                | MessageType::SIGNAL
        ) {
            tracing::debug!(ty = self.buf[1], serial, "skipping message of unknown type");
            return Ok(Some((total, None)));
        }

        let serial = NonZeroU32::new(serial).ok_or(ErrorKind::ZeroSerial)?;
        let flags = Flags(self.buf[2]);
        let fields = self.parse_fields(&mut dec, fields_end)?;

        dec.align(8)?;
        let body_bytes = &self.buf[body_start..total];
        let signature = fields.signature.unwrap_or_else(SignatureBuf::empty);
        let body = codec::decode_body(endianness, &signature, body_bytes)?;

        let kind = match message_type {
            MessageType::METHOD_CALL => MessageKind::MethodCall {
                path: fields.path.ok_or(ErrorKind::MissingPath)?,
                member: fields.member.ok_or(ErrorKind::MissingMember)?,
            },
            MessageType::METHOD_RETURN => MessageKind::MethodReturn {
                reply_serial: fields.reply_serial.ok_or(ErrorKind::MissingReplySerial)?,
            },
            MessageType::ERROR => MessageKind::Error {
                error_name: fields.error_name.ok_or(ErrorKind::MissingErrorName)?,
                reply_serial: fields.reply_serial.ok_or(ErrorKind::MissingReplySerial)?,
            },
            MessageType::SIGNAL => {
                if fields.interface.is_none() {
                    return Err(ErrorKind::MalformedHeader("signal without an interface").into());
                }

                MessageKind::Signal {
                    path: fields.path.ok_or(ErrorKind::MissingPath)?,
                    member: fields.member.ok_or(ErrorKind::MissingMember)?,
                }
            }
            _ => unreachable!(),
        };

        let message = Message {
            kind,
            serial,
            flags,
            interface: fields.interface,
            destination: fields.destination,
            sender: fields.sender,
            signature,
            body,
        };

        Ok(Some((total, Some(message))))
    }

    fn parse_fields(&self, dec: &mut Decoder<'_>, fields_end: usize) -> Result<Fields> {
        let mut fields = Fields::default();

        while dec.offset() < fields_end {
            dec.align(8)?;

            if dec.offset() >= fields_end {
                break;
            }

            let field = Field(dec.read_u8()?);
            let signature = dec.read_signature()?;

            match (field, signature.as_bytes()) {
                (Field::PATH, b"o") => {
                    dec.align(4)?;
                    fields.path = Some(dec.read_str()?.to_owned());
                }
                (Field::INTERFACE, b"s") => {
                    dec.align(4)?;
                    fields.interface = Some(dec.read_str()?.to_owned());
                }
                (Field::MEMBER, b"s") => {
                    dec.align(4)?;
                    fields.member = Some(dec.read_str()?.to_owned());
                }
                (Field::ERROR_NAME, b"s") => {
                    dec.align(4)?;
                    fields.error_name = Some(dec.read_str()?.to_owned());
                }
                (Field::REPLY_SERIAL, b"u") => {
                    dec.align(4)?;
                    let serial = dec.read_u32()?;
                    fields.reply_serial =
                        Some(NonZeroU32::new(serial).ok_or(ErrorKind::ZeroReplySerial)?);
                }
                (Field::DESTINATION, b"s") => {
                    dec.align(4)?;
                    fields.destination = Some(dec.read_str()?.to_owned());
                }
                (Field::SENDER, b"s") => {
                    dec.align(4)?;
                    fields.sender = Some(dec.read_str()?.to_owned());
                }
                (Field::SIGNATURE, b"g") => {
                    fields.signature = Some(dec.read_signature()?.to_owned());
                }
                _ => {
                    // Unknown field or unexpected signature, skip the value.
                    for ty in signature.iter() {
                        dec.read_value(ty)?;
                    }
                }
            }
        }

        if dec.offset() != fields_end {
            return Err(ErrorKind::MalformedHeader("field ran past declared length").into());
        }

        Ok(fields)
    }
}

#[derive(Default)]
struct Fields {
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<NonZeroU32>,
    destination: Option<String>,
    sender: Option<String>,
    signature: Option<SignatureBuf>,
}

/// A source of message serial numbers, monotonic from 1.
///
/// Exhausting the 32 bit serial space is a fatal condition; serials are
/// never reused within a connection.
pub struct SerialCounter {
    value: AtomicU32,
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialCounter {
    /// Construct a new counter starting at 1.
    pub fn new() -> Self {
        Self {
            value: AtomicU32::new(1),
        }
    }

    /// Allocate the next serial.
    ///
    /// # Errors
    ///
    /// Errors with a serial exhaustion error once the counter reaches the
    /// end of the 32 bit space. The error is sticky.
    pub fn next(&self) -> Result<NonZeroU32> {
        let serial = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_add(1)
            })
            .map_err(|_| ErrorKind::SerialsExhausted)?;

        NonZeroU32::new(serial).ok_or_else(|| ErrorKind::SerialsExhausted.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn hello() -> Message {
        Message::method_call("/org/freedesktop/DBus", "Hello", serial(1))
            .with_interface("org.freedesktop.DBus")
            .with_destination("org.freedesktop.DBus")
    }

    #[test]
    fn hello_layout_le() {
        let bytes = frame_message_with(&hello(), Endianness::LITTLE).unwrap();

        assert_eq!(
            &bytes[..proto::FIXED_HEADER_LENGTH],
            [
                b'l', 1, 0, 1, // endianness, type, flags, version
                0, 0, 0, 0, // body length
                1, 0, 0, 0, // serial
                109, 0, 0, 0, // header field array length
            ]
        );

        // Field array plus padding to the 8 byte boundary, empty body.
        assert_eq!(bytes.len(), 128);
    }

    #[test]
    fn round_trip_le() {
        let m = hello();
        let bytes = frame_message_with(&m, Endianness::LITTLE).unwrap();

        let mut deframer = Deframer::new();
        deframer.feed(&bytes);
        assert_eq!(deframer.next().unwrap(), Some(m));
        assert_eq!(deframer.next().unwrap(), None);
    }

    #[test]
    fn round_trip_be_with_body() {
        let m = Message::signal("/org/example", "Tick", serial(7))
            .with_interface("org.example.Clock")
            .with_body("su", vec![Value::from("now"), Value::Uint32(42)])
            .unwrap();

        let bytes = frame_message_with(&m, Endianness::BIG).unwrap();

        let mut deframer = Deframer::new();
        deframer.feed(&bytes);
        assert_eq!(deframer.next().unwrap(), Some(m));
    }

    #[test]
    fn dribbled_input() {
        let m = hello();
        let bytes = frame_message_with(&m, Endianness::LITTLE).unwrap();

        let mut deframer = Deframer::new();

        for chunk in bytes.chunks(3) {
            assert_eq!(deframer.next().unwrap(), None);
            deframer.feed(chunk);
        }

        assert_eq!(deframer.next().unwrap(), Some(m));
    }

    #[test]
    fn two_messages_in_one_feed() {
        let a = hello();
        let b = Message::method_return(serial(2), serial(1));

        let mut bytes = frame_message_with(&a, Endianness::LITTLE).unwrap();
        bytes.extend(frame_message_with(&b, Endianness::LITTLE).unwrap());

        let mut deframer = Deframer::new();
        deframer.feed(&bytes);
        assert_eq!(deframer.next().unwrap(), Some(a));
        assert_eq!(deframer.next().unwrap(), Some(b));
        assert_eq!(deframer.next().unwrap(), None);
    }

    #[test]
    fn unknown_endianness() {
        let mut deframer = Deframer::new();
        deframer.feed(&[b'x', 1, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);

        let error = deframer.next().unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::MalformedHeader("unknown endianness marker")
        ));
    }

    #[test]
    fn zero_serial_rejected() {
        let mut bytes = frame_message_with(&hello(), Endianness::LITTLE).unwrap();
        bytes[8..12].copy_from_slice(&[0, 0, 0, 0]);

        let mut deframer = Deframer::new();
        deframer.feed(&bytes);

        let error = deframer.next().unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::ZeroSerial));
    }

    #[test]
    fn serial_counter_monotonic() {
        let counter = SerialCounter::new();
        assert_eq!(counter.next().unwrap().get(), 1);
        assert_eq!(counter.next().unwrap().get(), 2);
        assert_eq!(counter.next().unwrap().get(), 3);
    }

    #[test]
    fn serial_counter_exhaustion_is_sticky() {
        let counter = SerialCounter {
            value: AtomicU32::new(u32::MAX),
        };

        let error = counter.next().unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::SerialsExhausted));

        let error = counter.next().unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::SerialsExhausted));
    }
}
