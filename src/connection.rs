//! The connection to a message bus and its lifecycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use crate::correlator::Correlator;
use crate::error::{Error, ErrorKind, Result};
use crate::frame::{frame_message, Deframer, SerialCounter};
use crate::interface::InterfaceDescription;
use crate::introspect;
use crate::message::{Message, MessageKind};
use crate::org_freedesktop_dbus as fdo;
use crate::proto::Flags;
use crate::proxy::Proxy;
use crate::router::{Dispatch, ExportRegistry, MethodHandlers, PathMatch, SignalRouter};
use crate::sasl;
use crate::signature::Signature;
use crate::transport::{self, BoxStream, BusAddress};
use crate::value::Value;

/// Options for establishing a [`Connection`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use wirebus::{ConnectionBuilder, PathMatch};
///
/// # #[tokio::main] async fn main() -> wirebus::Result<()> {
/// let c = ConnectionBuilder::new()
///     .default_timeout(Duration::from_secs(5))
///     .path_match(PathMatch::ExactOrPrefix)
///     .session()
///     .await?;
/// # Ok(()) }
/// ```
#[derive(Default)]
pub struct ConnectionBuilder {
    timeout: Option<Duration>,
    path_match: PathMatch,
}

impl ConnectionBuilder {
    /// Construct a builder with default options: no call timeout and exact
    /// path matching for signal subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default timeout applied to method calls. Without one, calls wait
    /// until the connection closes.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How subscription paths match the paths signals are emitted from.
    pub fn path_match(mut self, path_match: PathMatch) -> Self {
        self.path_match = path_match;
        self
    }

    /// Connect to the session bus, resolved from the environment.
    pub async fn session(self) -> Result<Connection> {
        let address = BusAddress::session()?;
        self.connect(&address).await
    }

    /// Connect to the system bus.
    pub async fn system(self) -> Result<Connection> {
        let address = BusAddress::system()?;
        self.connect(&address).await
    }

    /// Connect to the bus at the given address.
    pub async fn connect(self, address: &BusAddress) -> Result<Connection> {
        let stream = transport::connect(address).await?;
        self.establish(stream).await
    }

    /// Run a connection over an already open stream, typically a socket
    /// handed in by the caller. The handshake is performed on it like on
    /// any other transport.
    pub async fn from_stream<S>(self, stream: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.establish(Box::new(stream)).await
    }

    async fn establish(self, mut stream: BoxStream) -> Result<Connection> {
        let guid = sasl::handshake(&mut stream).await?;
        let (read, write) = tokio::io::split(stream);

        let inner = Arc::new(ConnectionInner {
            guid,
            serials: SerialCounter::new(),
            correlator: Correlator::new(),
            router: SignalRouter::new(self.path_match),
            exports: ExportRegistry::new(),
            writer: tokio::sync::Mutex::new(Some(write)),
            closed: AtomicBool::new(false),
            unique_name: OnceLock::new(),
            default_timeout: self.timeout,
            matches: Mutex::new(HashSet::new()),
            read_task: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(inner.clone(), read));
        *lock(&inner.read_task) = Some(task);

        let connection = Connection { inner };

        if let Err(error) = connection.hello().await {
            connection.close().await;
            return Err(error);
        }

        Ok(connection)
    }
}

/// An established connection to a message bus.
///
/// The connection is cheap to clone; clones share the underlying session.
/// See the crate-level documentation for an example.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect to the session bus with default options.
    pub async fn session_bus() -> Result<Connection> {
        ConnectionBuilder::new().session().await
    }

    /// Connect to the system bus with default options.
    pub async fn system_bus() -> Result<Connection> {
        ConnectionBuilder::new().system().await
    }

    /// Connect to the bus at the given address with default options.
    pub async fn connect(address: &BusAddress) -> Result<Connection> {
        ConnectionBuilder::new().connect(address).await
    }

    /// The unique name the bus assigned to this connection.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(|s| s.as_str())
    }

    /// The GUID the server reported during the handshake.
    pub fn server_guid(&self) -> &str {
        &self.inner.guid
    }

    /// Test if the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Invoke a method and await its reply.
    ///
    /// This is the untyped surface under [`Proxy::call`]; the signature
    /// describes the argument values.
    pub async fn method_call(
        &self,
        destination: &str,
        path: &str,
        interface: Option<&str>,
        member: &str,
        signature: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let signature = crate::SignatureBuf::new(signature)?;
        let timeout = self.inner.default_timeout;

        let reply = self
            .inner
            .invoke(destination, path, interface, member, &signature, args, timeout)
            .await?;

        Ok(reply.into_body())
    }

    /// Introspect the object at the given path, returning the interfaces
    /// it implements keyed by name.
    ///
    /// # Errors
    ///
    /// A remote error is reported as introspection being unavailable;
    /// malformed XML as an introspection parse error.
    pub async fn introspect(
        &self,
        destination: &str,
        path: &str,
    ) -> Result<BTreeMap<String, InterfaceDescription>> {
        let signature = Signature::empty();

        let reply = self
            .inner
            .invoke(
                destination,
                path,
                Some(fdo::INTROSPECTABLE),
                "Introspect",
                signature,
                Vec::new(),
                self.inner.default_timeout,
            )
            .await
            .map_err(|error| match error.remote_error() {
                Some((name, message)) => Error::new(ErrorKind::IntrospectionUnavailable {
                    name: name.into(),
                    message: message.into(),
                }),
                None => error,
            })?;

        let xml = match reply.body().first() {
            Some(Value::String(xml)) => xml,
            _ => {
                return Err(ErrorKind::IntrospectionParse(
                    "introspection reply without a string body".into(),
                )
                .into())
            }
        };

        introspect::parse_document(xml)
    }

    /// Introspect the remote object and build a proxy for one of its
    /// interfaces.
    ///
    /// # Errors
    ///
    /// Errors if introspection fails or does not list the interface.
    pub async fn get_proxy(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
    ) -> Result<Proxy> {
        let mut interfaces = self.introspect(destination, path).await?;

        let Some(description) = interfaces.remove(interface) else {
            return Err(ErrorKind::UnknownInterface(interface.into()).into());
        };

        Ok(self.proxy(destination, path, description))
    }

    /// Build a proxy from a caller-supplied interface description.
    pub fn proxy(
        &self,
        destination: &str,
        path: &str,
        description: InterfaceDescription,
    ) -> Proxy {
        Proxy::new(
            &self.inner,
            destination.to_owned(),
            path.to_owned(),
            description.name().to_owned(),
            Some(description),
        )
    }

    /// Build a proxy without a description. Calls pass through unchecked
    /// with signatures derived from the argument values.
    pub fn proxy_unchecked(&self, destination: &str, path: &str, interface: &str) -> Proxy {
        Proxy::new(
            &self.inner,
            destination.to_owned(),
            path.to_owned(),
            interface.to_owned(),
            None,
        )
    }

    /// Request a well-known name on the bus.
    pub async fn request_name(
        &self,
        name: &str,
        flags: fdo::NameFlag,
    ) -> Result<fdo::NameReply> {
        let reply = self
            .bus_call(
                "RequestName",
                "su",
                vec![Value::from(name), Value::Uint32(flags.0)],
            )
            .await?;

        match reply.first() {
            Some(Value::Uint32(n)) => Ok(fdo::NameReply(*n)),
            _ => Err(ErrorKind::TypeMismatch {
                expected: "u".into(),
                found: "RequestName reply",
            }
            .into()),
        }
    }

    /// Release a well-known name previously requested.
    pub async fn release_name(&self, name: &str) -> Result<fdo::ReleaseNameReply> {
        let reply = self
            .bus_call("ReleaseName", "s", vec![Value::from(name)])
            .await?;

        match reply.first() {
            Some(Value::Uint32(n)) => Ok(fdo::ReleaseNameReply(*n)),
            _ => Err(ErrorKind::TypeMismatch {
                expected: "u".into(),
                found: "ReleaseName reply",
            }
            .into()),
        }
    }

    /// Export an interface at the given path, answering method calls with
    /// the given handlers.
    ///
    /// Exported objects also answer standard introspection for the
    /// interfaces exported at their path.
    ///
    /// # Errors
    ///
    /// Errors if the connection has been closed.
    pub fn export(
        &self,
        path: &str,
        description: InterfaceDescription,
        handlers: MethodHandlers,
    ) -> Result<ExportedObject> {
        if self.is_closed() {
            return Err(ErrorKind::ConnectionClosed.into());
        }

        let interface = description.name().to_owned();
        self.inner.exports.insert(path, description, handlers);

        Ok(ExportedObject {
            inner: Arc::downgrade(&self.inner),
            path: path.to_owned(),
            interface,
        })
    }

    /// Remove every interface exported at the given path.
    ///
    /// # Errors
    ///
    /// Errors if the connection has been closed.
    pub fn unexport(&self, path: &str) -> Result<()> {
        if self.is_closed() {
            return Err(ErrorKind::ConnectionClosed.into());
        }

        self.inner.exports.remove(path);
        Ok(())
    }

    /// Close the connection.
    ///
    /// Every pending call fails with a connection closed error, exactly
    /// once; subscriptions become inert. Closing an already closed
    /// connection does nothing.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    async fn hello(&self) -> Result<()> {
        let reply = self
            .bus_call("Hello", "", Vec::new())
            .await?;

        match reply.first() {
            Some(Value::String(name)) => {
                let _ = self.inner.unique_name.set(name.clone());
                tracing::debug!(name = name.as_str(), "connected to bus");
                Ok(())
            }
            _ => Err(ErrorKind::TypeMismatch {
                expected: "s".into(),
                found: "Hello reply",
            }
            .into()),
        }
    }

    async fn bus_call(
        &self,
        member: &str,
        signature: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        self.method_call(
            fdo::DESTINATION,
            fdo::PATH,
            Some(fdo::INTERFACE),
            member,
            signature,
            args,
        )
        .await
    }
}

/// A handle to an interface exported on a connection, used to emit its
/// signals. Holds no strong reference to the connection.
#[derive(Clone, Debug)]
pub struct ExportedObject {
    inner: std::sync::Weak<ConnectionInner>,
    path: String,
    interface: String,
}

impl ExportedObject {
    /// The path the interface is exported at.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The name of the exported interface.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Broadcast a signal from the exported interface.
    ///
    /// # Errors
    ///
    /// Errors if the interface does not declare the signal, if the
    /// arguments do not match its signature, or if the connection has gone
    /// away.
    pub async fn emit(&self, signal: &str, args: Vec<Value>) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(ErrorKind::ConnectionClosed.into());
        };

        let Some(description) = inner.exports.description(&self.path, &self.interface) else {
            return Err(ErrorKind::UnknownInterface(self.interface.as_str().into()).into());
        };

        let Some(signature) = description.signal(signal) else {
            return Err(ErrorKind::UnknownSignal(signal.into()).into());
        };

        let Some(sender) = inner.unique_name.get() else {
            return Err(ErrorKind::NotReady.into());
        };

        let message = Message::signal(&self.path, signal, inner.serials.next()?)
            .with_interface(&self.interface)
            .with_sender(sender.clone())
            .with_body(signature.as_str(), args)?;

        inner.send_message(&message).await
    }
}

/// The shared state of a connection.
pub(crate) struct ConnectionInner {
    guid: Box<str>,
    serials: SerialCounter,
    correlator: Correlator,
    router: SignalRouter,
    exports: ExportRegistry,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxStream>>>,
    closed: AtomicBool,
    unique_name: OnceLock<String>,
    default_timeout: Option<Duration>,
    matches: Mutex<HashSet<(String, String)>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub(crate) fn router(&self) -> &SignalRouter {
        &self.router
    }

    /// Send a method call and await the correlated reply.
    ///
    /// A remote error reply surfaces as an error carrying its name and
    /// message. Timing out removes the pending entry before returning, so
    /// a reply racing in afterwards is dropped as unmatched.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn invoke(
        &self,
        destination: &str,
        path: &str,
        interface: Option<&str>,
        member: &str,
        signature: &Signature,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let serial = self.serials.next()?;

        let mut message = Message::method_call(path, member, serial)
            .with_destination(destination)
            .with_body(signature.as_str(), args)?;

        if let Some(interface) = interface {
            message = message.with_interface(interface);
        }

        if let Some(sender) = self.unique_name.get() {
            message = message.with_sender(sender.clone());
        }

        let rx = self.correlator.register(serial)?;

        if let Err(error) = self.send_message(&message).await {
            self.correlator.forget(serial);
            return Err(error);
        }

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(..) => {
                    self.correlator.forget(serial);
                    return Err(ErrorKind::Timeout.into());
                }
            },
            None => rx.await,
        };

        let reply = match received {
            Ok(reply) => reply?,
            Err(..) => return Err(ErrorKind::ConnectionClosed.into()),
        };

        match reply.error_parts() {
            Some((name, message)) => Err(Error::new(ErrorKind::RemoteError {
                name: name.into(),
                message: message.into(),
            })),
            None => Ok(reply),
        }
    }

    /// Frame and write a message. Writers from concurrent tasks are
    /// serialized on the writer lock.
    pub(crate) async fn send_message(&self, message: &Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::ConnectionClosed.into());
        }

        let bytes = frame_message(message)?;
        let mut writer = self.writer.lock().await;

        let Some(writer) = writer.as_mut() else {
            return Err(ErrorKind::ConnectionClosed.into());
        };

        writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Ask the bus to route matching signals here. Issued once per
    /// subscribed (path, interface) pair; replies are not expected.
    pub(crate) async fn ensure_match(&self, path: &str, interface: &str) -> Result<()> {
        let first = lock(&self.matches).insert((path.to_owned(), interface.to_owned()));

        if !first {
            return Ok(());
        }

        let rule = format!("type='signal',path='{path}',interface='{interface}'");

        let message = Message::method_call(fdo::PATH, "AddMatch", self.serials.next()?)
            .with_interface(fdo::INTERFACE)
            .with_destination(fdo::DESTINATION)
            .with_flags(Flags::NO_REPLY_EXPECTED)
            .with_body("s", vec![Value::String(rule)])?;

        self.send_message(&message).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        self.correlator.close();

        // Taken last so the read task can run close() on itself.
        let task = lock(&self.read_task).take();

        if let Some(task) = task {
            task.abort();
        }
    }

    async fn dispatch_incoming(self: &Arc<Self>, message: Message) {
        match &message.kind {
            MessageKind::MethodReturn { reply_serial }
            | MessageKind::Error { reply_serial, .. } => {
                let reply_serial = *reply_serial;

                if let Some(unmatched) = self.correlator.complete(reply_serial, message) {
                    tracing::debug!(
                        reply_serial = reply_serial.get(),
                        serial = unmatched.serial().get(),
                        "dropping unmatched reply"
                    );
                }
            }
            MessageKind::Signal { .. } => {
                self.router.deliver(&message);
            }
            MessageKind::MethodCall { .. } => {
                self.answer_call(&message).await;
            }
        }
    }

    async fn answer_call(&self, call: &Message) {
        let outcome = self.exports.dispatch(call);

        if !call.wants_reply() {
            return;
        }

        let serial = match self.serials.next() {
            Ok(serial) => serial,
            Err(error) => {
                tracing::error!(?error, "cannot allocate a reply serial");
                return;
            }
        };

        let reply = match outcome {
            Dispatch::Reply(signature, body) => {
                Message::method_return(serial, call.serial())
                    .with_body(signature.as_str(), body)
            }
            Dispatch::Error(error) => Ok(Message::error(error.name(), serial, call.serial())
                .with_body("s", vec![Value::from(error.message())])
                .unwrap_or_else(|_| Message::error(error.name(), serial, call.serial()))),
        };

        let mut reply = match reply {
            Ok(reply) => reply,
            Err(error) => {
                tracing::error!(?error, "exported method reply does not match its signature");
                Message::error(fdo::ERROR_FAILED, serial, call.serial())
            }
        };

        if let Some(sender) = call.sender() {
            reply = reply.with_destination(sender);
        }

        if let Some(name) = self.unique_name.get() {
            reply = reply.with_sender(name.clone());
        }

        if let Err(error) = self.send_message(&reply).await {
            tracing::debug!(?error, "failed to send reply");
        }
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut read: ReadHalf<BoxStream>) {
    let mut deframer = Deframer::new();
    let mut buf = [0u8; 4096];

    loop {
        match read.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("bus closed the connection");
                break;
            }
            Ok(n) => {
                deframer.feed(&buf[..n]);

                loop {
                    match deframer.next() {
                        Ok(Some(message)) => inner.dispatch_incoming(message).await,
                        Ok(None) => break,
                        Err(error) => {
                            tracing::error!(?error, "lost framing on the connection");
                            inner.close().await;
                            return;
                        }
                    }
                }
            }
            Err(error) => {
                tracing::debug!(?error, "read error on the connection");
                break;
            }
        }
    }

    inner.close().await;
}

/// The kind of shared bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// The per-session bus.
    Session,
    /// The system-wide bus.
    System,
}

static SHARED: OnceLock<tokio::sync::Mutex<HashMap<BusKind, Connection>>> = OnceLock::new();

/// Get the process-wide shared connection to the given bus, establishing it
/// on first use. A previously shared connection which has since closed is
/// replaced.
pub async fn shared_bus(kind: BusKind) -> Result<Connection> {
    let shared = SHARED.get_or_init(|| tokio::sync::Mutex::new(HashMap::new()));
    let mut shared = shared.lock().await;

    if let Some(connection) = shared.get(&kind) {
        if !connection.is_closed() {
            return Ok(connection.clone());
        }
    }

    let connection = match kind {
        BusKind::Session => Connection::session_bus().await?,
        BusKind::System => Connection::system_bus().await?,
    };

    shared.insert(kind, connection.clone());
    Ok(connection)
}

/// Close and drop every process-wide shared bus connection.
pub async fn reset_shared_buses() {
    let Some(shared) = SHARED.get() else {
        return;
    };

    let connections = {
        let mut shared = shared.lock().await;
        shared.drain().collect::<Vec<_>>()
    };

    for (_, connection) in connections {
        connection.close().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
