//! An asynchronous D-Bus protocol engine for Tokio.
//!
//! This crate implements the client side of the D-Bus wire protocol: it
//! connects to a message bus, performs the SASL handshake, frames and
//! deframes binary messages, correlates method returns with outstanding
//! calls, parses introspection XML into callable proxies, and dispatches
//! incoming signals to subscribers. A minimal server side is provided
//! through interface export, which answers method calls and emits signals.
//!
//! # Examples
//!
//! ```no_run
//! use wirebus::Connection;
//!
//! # #[tokio::main] async fn main() -> wirebus::Result<()> {
//! let c = Connection::session_bus().await?;
//!
//! let proxy = c
//!     .get_proxy(
//!         "org.freedesktop.DBus",
//!         "/org/freedesktop/DBus",
//!         "org.freedesktop.DBus",
//!     )
//!     .await?;
//!
//! let names = proxy.call("ListNames", vec![]).await?;
//! println!("{names:?}");
//! # Ok(()) }
//! ```

#[macro_use]
mod macros;

pub mod proto;

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

#[doc(inline)]
pub use self::signature::{Signature, SignatureBuf, SignatureError};
mod signature;

#[doc(inline)]
pub use self::value::{Array, Value};
mod value;

pub(crate) mod codec;

#[doc(inline)]
pub use self::message::{Message, MessageKind};
mod message;

#[doc(inline)]
pub use self::frame::{frame_message, frame_message_with, Deframer, SerialCounter};
mod frame;

pub mod sasl;

#[doc(inline)]
pub use self::transport::BusAddress;
mod transport;

pub(crate) mod correlator;

#[doc(inline)]
pub use self::interface::{
    InterfaceBuilder, InterfaceDescription, MethodDescription, PropertyAccess,
    PropertyDescription,
};
mod interface;

mod introspect;

#[doc(inline)]
pub use self::router::{MethodError, MethodHandlers, PathMatch, Subscription};
mod router;

#[doc(inline)]
pub use self::proxy::Proxy;
mod proxy;

#[doc(inline)]
pub use self::connection::{
    reset_shared_buses, shared_bus, BusKind, Connection, ConnectionBuilder, ExportedObject,
};
mod connection;

pub mod org_freedesktop_dbus;
