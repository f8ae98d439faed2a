//! Bus addresses and the streams connecting to them.

use std::env;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::error::{ErrorKind, Result};

/// The environment variable holding the session bus address.
const SESSION_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
/// The environment variable holding the system bus address.
const SYSTEM_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
/// The well-known system bus path, used if the environment does not say
/// otherwise.
const DEFAULT_SYSTEM: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// The address of a message bus.
///
/// # Examples
///
/// ```
/// use wirebus::BusAddress;
///
/// let a = BusAddress::parse("unix:path=/run/user/1000/bus")?;
/// assert!(matches!(a, BusAddress::Unix(..)));
///
/// let a = BusAddress::parse("tcp:host=localhost,port=4444")?;
/// assert!(matches!(a, BusAddress::Tcp(..)));
/// # Ok::<_, wirebus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BusAddress {
    /// A unix domain socket at the given path.
    Unix(PathBuf),
    /// A TCP connection to the given host and port.
    Tcp(String, u16),
}

impl BusAddress {
    /// Parse a bus address.
    ///
    /// Address strings may list several addresses separated by `;`; the
    /// first one in a supported format is used.
    ///
    /// # Errors
    ///
    /// Errors if no listed address is in a supported format.
    pub fn parse(address: &str) -> Result<BusAddress> {
        for candidate in address.split(';') {
            if let Some(address) = Self::parse_one(candidate) {
                return Ok(address);
            }
        }

        Err(ErrorKind::InvalidAddress.into())
    }

    fn parse_one(address: &str) -> Option<BusAddress> {
        let (transport, rest) = address.split_once(':')?;

        let mut pairs = rest.split(',').filter_map(|pair| pair.split_once('='));

        match transport {
            "unix" => {
                let path = pairs.find_map(|(k, v)| (k == "path").then_some(v))?;
                Some(BusAddress::Unix(PathBuf::from(path)))
            }
            "tcp" => {
                let mut host = None;
                let mut port = None;

                for (k, v) in pairs {
                    match k {
                        "host" => host = Some(v),
                        "port" => port = v.parse().ok(),
                        _ => {}
                    }
                }

                Some(BusAddress::Tcp(host?.to_owned(), port?))
            }
            _ => None,
        }
    }

    /// The address of the session bus, from the environment.
    ///
    /// # Errors
    ///
    /// Errors if `DBUS_SESSION_BUS_ADDRESS` is not set or does not contain
    /// a supported address.
    pub fn session() -> Result<BusAddress> {
        match env::var_os(SESSION_ENV) {
            Some(address) => {
                let address = address.to_str().ok_or(ErrorKind::InvalidAddress)?;
                Self::parse(address)
            }
            None => Err(ErrorKind::MissingBus.into()),
        }
    }

    /// The address of the system bus, from the environment with a fallback
    /// to the well-known path.
    pub fn system() -> Result<BusAddress> {
        match env::var_os(SYSTEM_ENV) {
            Some(address) => {
                let address = address.to_str().ok_or(ErrorKind::InvalidAddress)?;
                Self::parse(address)
            }
            None => Self::parse(DEFAULT_SYSTEM),
        }
    }
}

/// The boxed stream a connection runs over.
pub(crate) type BoxStream = Box<dyn Stream>;

pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Open a stream to the given address.
pub(crate) async fn connect(address: &BusAddress) -> Result<BoxStream> {
    match address {
        BusAddress::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        BusAddress::Tcp(host, port) => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            Ok(Box::new(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix() {
        let a = BusAddress::parse("unix:path=/run/user/1000/bus").unwrap();
        assert_eq!(a, BusAddress::Unix(PathBuf::from("/run/user/1000/bus")));
    }

    #[test]
    fn parse_tcp() {
        let a = BusAddress::parse("tcp:host=127.0.0.1,port=12345").unwrap();
        assert_eq!(a, BusAddress::Tcp("127.0.0.1".into(), 12345));
    }

    #[test]
    fn first_supported_address_wins() {
        let a = BusAddress::parse("unixexec:path=/bin/false;unix:path=/tmp/bus").unwrap();
        assert_eq!(a, BusAddress::Unix(PathBuf::from("/tmp/bus")));
    }

    #[test]
    fn unsupported_addresses() {
        assert!(BusAddress::parse("unix:abstract=/tmp/x").is_err());
        assert!(BusAddress::parse("tcp:host=only").is_err());
        assert!(BusAddress::parse("launchd:env=DBUS").is_err());
        assert!(BusAddress::parse("").is_err());
    }
}
