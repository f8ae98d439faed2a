//! Types for the SASL handshake which precedes the binary D-Bus protocol.
//!
//! Only the `EXTERNAL` mechanism is supported, which authenticates through
//! the credentials of the underlying socket. The client sends a single NUL
//! byte, an `AUTH EXTERNAL` line carrying the uid, and after a positive
//! response a `BEGIN` line, after which the stream switches to framed
//! messages.

use std::fmt::Write as _;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorKind, Result};

/// A SASL request sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SaslRequest<'a> {
    /// Authenticate with the given mechanism.
    Auth(Auth<'a>),
}

/// An authentication mechanism and its initial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Auth<'a> {
    /// The `EXTERNAL` mechanism. The payload is the uid of the process,
    /// encoded as the hex of its decimal digits.
    External(&'a str),
}

/// A positive SASL response from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid<'a>(&'a str);

impl<'a> Guid<'a> {
    /// The GUID of the server as a string.
    pub fn as_str(&self) -> &'a str {
        self.0
    }
}

/// Format a request into its line representation, including the trailing
/// CRLF.
pub fn format_request(request: &SaslRequest<'_>) -> String {
    match request {
        SaslRequest::Auth(Auth::External(payload)) => {
            format!("AUTH EXTERNAL {payload}\r\n")
        }
    }
}

/// Parse a response line, without its CRLF.
///
/// # Errors
///
/// Anything but an `OK` response is an authentication failure, including
/// `REJECTED` listing the mechanisms the server would have accepted.
pub fn parse_response(line: &str) -> Result<Guid<'_>> {
    match line.split_once(' ') {
        Some(("OK", guid)) => Ok(Guid(guid)),
        _ => Err(ErrorKind::AuthenticationFailed(line.into()).into()),
    }
}

/// The `EXTERNAL` payload for the given uid.
///
/// # Examples
///
/// ```
/// assert_eq!(wirebus::sasl::external_payload(1000), "31303030");
/// ```
pub fn external_payload(uid: u32) -> String {
    let decimal = uid.to_string();
    let mut out = String::with_capacity(decimal.len() * 2);

    for b in decimal.bytes() {
        let _ = write!(out, "{b:02x}");
    }

    out
}

/// Drive the handshake over the given stream, authenticating as the current
/// process. Returns the GUID reported by the server.
pub(crate) async fn handshake<S>(stream: &mut S) -> Result<Box<str>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SAFETY: getuid never fails.
    let uid = unsafe { libc::getuid() };

    let payload = external_payload(uid);
    let request = format_request(&SaslRequest::Auth(Auth::External(&payload)));

    stream.write_all(&[0]).await?;
    stream.write_all(request.as_bytes()).await?;

    let line = read_line(stream).await?;
    let guid = parse_response(&line)?;
    tracing::trace!(guid = guid.as_str(), "authenticated");
    let guid = Box::from(guid.as_str());

    stream.write_all(b"BEGIN\r\n").await?;
    Ok(guid)
}

async fn read_line<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();

    loop {
        let b = stream.read_u8().await?;

        if b == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            return Ok(String::from_utf8_lossy(&line).into_owned());
        }

        line.push(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_payloads() {
        assert_eq!(external_payload(0), "30");
        assert_eq!(external_payload(1000), "31303030");
        assert_eq!(external_payload(65534), "3635353334");
    }

    #[test]
    fn request_lines() {
        let request = SaslRequest::Auth(Auth::External("31303030"));
        assert_eq!(format_request(&request), "AUTH EXTERNAL 31303030\r\n");
    }

    #[test]
    fn responses() {
        let guid = parse_response("OK abcdef0123456789").unwrap();
        assert_eq!(guid.as_str(), "abcdef0123456789");

        let error = parse_response("REJECTED EXTERNAL DBUS_COOKIE_SHA1").unwrap_err();
        assert!(error.is_authentication_failed());

        assert!(parse_response("ERROR").is_err());
    }
}
