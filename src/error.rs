use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::SignatureError;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    #[cfg(test)]
    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Test if the error indicates that a method call timed out.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Test if the error indicates that the connection has been closed.
    #[inline]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::ConnectionClosed)
    }

    /// Test if the error indicates that arguments did not match the method
    /// being invoked.
    #[inline]
    pub fn is_argument_mismatch(&self) -> bool {
        matches!(self.kind, ErrorKind::ArgumentMismatch(..))
    }

    /// Test if the error indicates a method missing from an interface
    /// description.
    #[inline]
    pub fn is_unknown_method(&self) -> bool {
        matches!(self.kind, ErrorKind::UnknownMethod(..))
    }

    /// Test if the error indicates a signal missing from an interface
    /// description.
    #[inline]
    pub fn is_unknown_signal(&self) -> bool {
        matches!(self.kind, ErrorKind::UnknownSignal(..))
    }

    /// Test if the error indicates that authentication with the bus failed.
    #[inline]
    pub fn is_authentication_failed(&self) -> bool {
        matches!(self.kind, ErrorKind::AuthenticationFailed(..))
    }

    /// The error name and message of a D-Bus error returned by the remote
    /// peer, if this is one.
    #[inline]
    pub fn remote_error(&self) -> Option<(&str, &str)> {
        match &self.kind {
            ErrorKind::RemoteError { name, message } => Some((name, message)),
            _ => None,
        }
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8Error(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(..) => write!(f, "I/O error"),
            ErrorKind::Signature(..) => write!(f, "Signature error"),
            ErrorKind::Utf8Error(..) => write!(f, "UTF-8 error"),
            ErrorKind::AuthenticationFailed(response) => {
                write!(f, "Authentication rejected by bus: {response}")
            }
            ErrorKind::MissingBus => write!(f, "Missing bus to connect to"),
            ErrorKind::InvalidAddress => write!(f, "Invalid d-bus address"),
            ErrorKind::MalformedHeader(what) => write!(f, "Malformed message header: {what}"),
            ErrorKind::TruncatedMessage => write!(f, "Unexpected end of message data"),
            ErrorKind::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected `{expected}`, found {found}")
            }
            ErrorKind::ArgumentMismatch(reason) => {
                write!(f, "Arguments do not match method: {reason}")
            }
            ErrorKind::Timeout => write!(f, "Method call timed out"),
            ErrorKind::ConnectionClosed => write!(f, "Connection closed"),
            ErrorKind::NotReady => write!(f, "Connection is not ready"),
            ErrorKind::RemoteError { name, message } => write!(f, "{name}: {message}"),
            ErrorKind::IntrospectionUnavailable { name, message } => {
                write!(f, "Introspection unavailable: {name}: {message}")
            }
            ErrorKind::IntrospectionParse(reason) => {
                write!(f, "Malformed introspection XML: {reason}")
            }
            ErrorKind::UnknownMethod(name) => {
                write!(f, "Method `{name}` not present in interface description")
            }
            ErrorKind::UnknownSignal(name) => {
                write!(f, "Signal `{name}` not present in interface description")
            }
            ErrorKind::UnknownInterface(name) => {
                write!(f, "Interface `{name}` not present on the object")
            }
            ErrorKind::SerialsExhausted => write!(f, "Message serial numbers exhausted"),
            ErrorKind::BodyTooLong(length) => {
                write!(f, "Body of length {length} is too long (max is 134217728)")
            }
            ErrorKind::HeaderTooLong(length) => {
                write!(
                    f,
                    "Header of length {length} is too long (max is 134217728)"
                )
            }
            ErrorKind::ArrayTooLong(length) => {
                write!(f, "Array of length {length} is too long (max is 67108864)")
            }
            ErrorKind::NotNullTerminated => write!(f, "String is not null terminated"),
            ErrorKind::InvalidBoolean(value) => {
                write!(f, "Invalid boolean value {value} (must be 0 or 1)")
            }
            ErrorKind::ZeroSerial => write!(f, "Zero in header serial"),
            ErrorKind::ZeroReplySerial => write!(f, "Zero REPLY_SERIAL header"),
            ErrorKind::MissingPath => write!(f, "Missing required PATH header"),
            ErrorKind::MissingMember => write!(f, "Missing required MEMBER header"),
            ErrorKind::MissingReplySerial => {
                write!(f, "Missing required REPLY_SERIAL header")
            }
            ErrorKind::MissingErrorName => write!(f, "Missing required ERROR_NAME header"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::Utf8Error(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Signature(SignatureError),
    Utf8Error(Utf8Error),
    AuthenticationFailed(Box<str>),
    MissingBus,
    InvalidAddress,
    MalformedHeader(&'static str),
    TruncatedMessage,
    TypeMismatch {
        expected: Box<str>,
        found: &'static str,
    },
    ArgumentMismatch(Box<str>),
    Timeout,
    ConnectionClosed,
    NotReady,
    RemoteError {
        name: Box<str>,
        message: Box<str>,
    },
    IntrospectionUnavailable {
        name: Box<str>,
        message: Box<str>,
    },
    IntrospectionParse(Box<str>),
    UnknownMethod(Box<str>),
    UnknownSignal(Box<str>),
    UnknownInterface(Box<str>),
    SerialsExhausted,
    BodyTooLong(u32),
    HeaderTooLong(u32),
    ArrayTooLong(u32),
    NotNullTerminated,
    InvalidBoolean(u32),
    ZeroSerial,
    ZeroReplySerial,
    MissingPath,
    MissingMember,
    MissingReplySerial,
    MissingErrorName,
}
