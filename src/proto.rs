//! Low level details for the D-Bus wire protocol.

/// The protocol version spoken by this crate.
pub const VERSION: u8 = 1;

/// The size of the fixed portion of a message header, including the length
/// prefix of the header field array which directly follows it.
pub(crate) const FIXED_HEADER_LENGTH: usize = 16;

/// The maximum length of an array in bytes.
pub(crate) const MAX_ARRAY_LENGTH: u32 = 1u32 << 26;

/// The maximum length of a message body in bytes.
pub(crate) const MAX_BODY_LENGTH: u32 = 1u32 << 27;

raw_enum! {
    /// The endianness of a message.
    #[repr(u8)]
    pub enum Endianness {
        /// Little endian.
        LITTLE = b'l',
        /// Big endian.
        BIG = b'B',
    }
}

impl Endianness {
    /// Native endian.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Self::LITTLE;
    /// Native endian.
    #[cfg(target_endian = "big")]
    pub const NATIVE: Self = Self::BIG;
}

raw_enum! {
    /// The type of a message.
    #[repr(u8)]
    pub(crate) enum MessageType {
        /// Method call. This message type may prompt a reply.
        METHOD_CALL = 1,
        /// Method reply with returned data.
        METHOD_RETURN = 2,
        /// Error reply. If the first argument exists and is a string, it is
        /// an error message.
        ERROR = 3,
        /// Signal emission.
        SIGNAL = 4,
    }
}

raw_set! {
    /// Flags inside of a D-Bus message.
    ///
    /// # Examples
    ///
    /// ```
    /// use wirebus::proto::Flags;
    ///
    /// let flags = Flags::EMPTY;
    /// assert!(!(flags & Flags::NO_REPLY_EXPECTED));
    ///
    /// let flags = Flags::EMPTY | Flags::NO_REPLY_EXPECTED;
    /// assert!(flags & Flags::NO_REPLY_EXPECTED);
    /// assert!(!(flags & Flags::NO_AUTO_START));
    /// ```
    #[repr(u8)]
    pub enum Flags {
        /// An empty set of flags.
        EMPTY = 0,
        /// This message does not expect method return replies or error
        /// replies, even if it is of a type that can have a reply; the reply
        /// should be omitted.
        NO_REPLY_EXPECTED = 1,
        /// The bus must not launch an owner for the destination name in
        /// response to this message.
        NO_AUTO_START = 2,
        /// The caller is prepared to wait for interactive authorization,
        /// which might take a considerable time to complete.
        ALLOW_INTERACTIVE_AUTHORIZATION = 4,
    }
}

raw_enum! {
    /// The code of a header field.
    #[repr(u8)]
    pub(crate) enum Field {
        /// The object to send a call to, or the object a signal is emitted
        /// from.
        PATH = 1,
        /// The interface to invoke a method call on, or that a signal is
        /// emitted from. Optional for method calls, required for signals.
        INTERFACE = 2,
        /// The member, either the method name or signal name.
        MEMBER = 3,
        /// The name of the error that occurred, for errors.
        ERROR_NAME = 4,
        /// The serial number of the message this message is a reply to.
        REPLY_SERIAL = 5,
        /// The name of the connection this message is intended for.
        DESTINATION = 6,
        /// Unique name of the sending connection.
        SENDER = 7,
        /// The signature of the message body. If omitted, it is assumed to
        /// be the empty signature and the body must be 0-length.
        SIGNATURE = 8,
        /// The number of Unix file descriptors that accompany the message.
        UNIX_FDS = 9,
    }
}

raw_enum! {
    /// A type code inside of a signature.
    #[repr(u8)]
    pub(crate) enum Type {
        /// 8-bit unsigned integer.
        BYTE = b'y',
        /// Boolean value, 0 is FALSE and 1 is TRUE. Everything else is
        /// invalid.
        BOOLEAN = b'b',
        /// 16-bit signed integer.
        INT16 = b'n',
        /// 16-bit unsigned integer.
        UINT16 = b'q',
        /// 32-bit signed integer.
        INT32 = b'i',
        /// 32-bit unsigned integer.
        UINT32 = b'u',
        /// 64-bit signed integer.
        INT64 = b'x',
        /// 64-bit unsigned integer.
        UINT64 = b't',
        /// IEEE 754 double.
        DOUBLE = b'd',
        /// UTF-8 string. Must be NUL terminated and contain no other NUL
        /// bytes.
        STRING = b's',
        /// Name of an object instance.
        OBJECT_PATH = b'o',
        /// A type signature.
        SIGNATURE = b'g',
        /// Array.
        ARRAY = b'a',
        /// Variant type, the type of the value is part of the value itself.
        VARIANT = b'v',
        /// Start of a struct.
        OPEN_PAREN = b'(',
        /// End of a struct.
        CLOSE_PAREN = b')',
        /// Start of a dict entry.
        OPEN_BRACE = b'{',
        /// End of a dict entry.
        CLOSE_BRACE = b'}',
        /// Unix file descriptor. Recognized by the signature validator, but
        /// carrying one is not supported by this crate.
        UNIX_FD = b'h',
    }
}

impl Type {
    /// Natural alignment of the type in bytes, relative to the start of the
    /// enclosing body or header.
    pub(crate) fn alignment(self) -> usize {
        match self {
            Type::BYTE | Type::SIGNATURE | Type::VARIANT => 1,
            Type::INT16 | Type::UINT16 => 2,
            Type::BOOLEAN
            | Type::INT32
            | Type::UINT32
            | Type::STRING
            | Type::OBJECT_PATH
            | Type::ARRAY
            | Type::UNIX_FD => 4,
            Type::INT64
            | Type::UINT64
            | Type::DOUBLE
            | Type::OPEN_PAREN
            | Type::OPEN_BRACE => 8,
            _ => 1,
        }
    }
}

/// Calculate the padding needed to align `len` to `align`, which must be a
/// power of two.
#[inline(always)]
pub(crate) fn padding_to(align: usize, len: usize) -> usize {
    let mask = align - 1;
    (align - (len & mask)) & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(padding_to(8, 0), 0);
        assert_eq!(padding_to(8, 1), 7);
        assert_eq!(padding_to(8, 8), 0);
        assert_eq!(padding_to(4, 6), 2);
        assert_eq!(padding_to(2, 3), 1);
        assert_eq!(padding_to(1, 17), 0);
    }

    #[test]
    fn flags() {
        let flags = Flags::NO_REPLY_EXPECTED | Flags::NO_AUTO_START;
        assert!(flags & Flags::NO_REPLY_EXPECTED);
        assert!(flags & Flags::NO_AUTO_START);
        assert!(!(flags & Flags::ALLOW_INTERACTIVE_AUTHORIZATION));
    }
}
