use std::num::NonZeroU32;

use crate::error::Result;
use crate::proto::Flags;
use crate::signature::{Signature, SignatureBuf};
use crate::value::Value;

/// The kind of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageKind {
    /// A method call to an object.
    MethodCall {
        /// The path of the object the call is sent to.
        path: String,
        /// The method being invoked.
        member: String,
    },
    /// A reply to a method call.
    MethodReturn {
        /// The serial of the call this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// An error reply to a method call.
    Error {
        /// The name of the error which occurred.
        error_name: String,
        /// The serial of the call this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// A broadcast signal emission.
    Signal {
        /// The path of the object the signal is emitted from.
        path: String,
        /// The name of the signal.
        member: String,
    },
}

/// A D-Bus message.
///
/// The body is carried decoded as a sequence of [`Value`]s alongside its
/// signature; the wire representation is produced and consumed by the
/// framing layer.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroU32;
/// use wirebus::{Message, Value};
///
/// let serial = NonZeroU32::new(1).unwrap();
///
/// let m = Message::method_call("/org/example", "Frobnicate", serial)
///     .with_interface("org.example.Iface")
///     .with_destination("org.example")
///     .with_body("s", vec![Value::from("hello")])?;
///
/// assert_eq!(m.signature(), "s");
/// # Ok::<_, wirebus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) serial: NonZeroU32,
    pub(crate) flags: Flags,
    pub(crate) interface: Option<String>,
    pub(crate) destination: Option<String>,
    pub(crate) sender: Option<String>,
    pub(crate) signature: SignatureBuf,
    pub(crate) body: Vec<Value>,
}

impl Message {
    fn new(kind: MessageKind, serial: NonZeroU32) -> Self {
        Self {
            kind,
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            signature: SignatureBuf::empty(),
            body: Vec::new(),
        }
    }

    /// Construct a method call.
    pub fn method_call(
        path: impl Into<String>,
        member: impl Into<String>,
        serial: NonZeroU32,
    ) -> Self {
        Self::new(
            MessageKind::MethodCall {
                path: path.into(),
                member: member.into(),
            },
            serial,
        )
    }

    /// Construct a method return replying to the given serial.
    pub fn method_return(serial: NonZeroU32, reply_serial: NonZeroU32) -> Self {
        Self::new(MessageKind::MethodReturn { reply_serial }, serial)
    }

    /// Construct an error replying to the given serial.
    pub fn error(
        error_name: impl Into<String>,
        serial: NonZeroU32,
        reply_serial: NonZeroU32,
    ) -> Self {
        Self::new(
            MessageKind::Error {
                error_name: error_name.into(),
                reply_serial,
            },
            serial,
        )
    }

    /// Construct a signal emission.
    pub fn signal(
        path: impl Into<String>,
        member: impl Into<String>,
        serial: NonZeroU32,
    ) -> Self {
        Self::new(
            MessageKind::Signal {
                path: path.into(),
                member: member.into(),
            },
            serial,
        )
    }

    /// The kind of the message.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// The serial of the message.
    pub fn serial(&self) -> NonZeroU32 {
        self.serial
    }

    /// The flags of the message.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The interface of the message, if any.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// The destination of the message, if any.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// The sender of the message, if any.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The signature of the message body.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The decoded body of the message.
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Take the body out of the message.
    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// Modify the flags of the message.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Modify the interface of the message.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Modify the destination of the message.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Modify the sender of the message.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Set the body of the message along with its signature.
    ///
    /// # Errors
    ///
    /// Errors if the signature is malformed. The values are checked against
    /// the signature when the message is framed.
    pub fn with_body(mut self, signature: &str, body: Vec<Value>) -> Result<Self> {
        self.signature = SignatureBuf::new(signature)?;
        self.body = body;
        Ok(self)
    }

    /// The serial this message is a reply to, if it is a reply.
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        match &self.kind {
            MessageKind::MethodReturn { reply_serial }
            | MessageKind::Error { reply_serial, .. } => Some(*reply_serial),
            _ => None,
        }
    }

    /// Test if the message expects a reply.
    pub(crate) fn wants_reply(&self) -> bool {
        matches!(self.kind, MessageKind::MethodCall { .. })
            && !(self.flags & Flags::NO_REPLY_EXPECTED)
    }

    /// Decompose an error message into its name and human readable message.
    ///
    /// By convention the first body value of an error is a string with the
    /// message.
    pub(crate) fn error_parts(&self) -> Option<(&str, &str)> {
        let MessageKind::Error { error_name, .. } = &self.kind else {
            return None;
        };

        let message = match self.body.first() {
            Some(Value::String(s)) => s.as_str(),
            _ => "",
        };

        Some((error_name, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn builder() {
        let m = Message::method_call("/path", "Method", serial(42))
            .with_destination("org.example")
            .with_flags(Flags::NO_REPLY_EXPECTED)
            .with_body("su", vec![Value::from("x"), Value::Uint32(2)])
            .unwrap();

        assert_eq!(
            m.kind(),
            &MessageKind::MethodCall {
                path: "/path".into(),
                member: "Method".into(),
            }
        );
        assert_eq!(m.serial().get(), 42);
        assert!(!m.wants_reply());
        assert_eq!(m.signature(), "su");
    }

    #[test]
    fn error_parts() {
        let m = Message::error("org.example.Error", serial(2), serial(1))
            .with_body("s", vec![Value::from("boom")])
            .unwrap();

        assert_eq!(m.error_parts(), Some(("org.example.Error", "boom")));
        assert_eq!(m.reply_serial(), Some(serial(1)));
    }
}
