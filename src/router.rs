//! Routing of incoming signals to subscribers and of incoming method calls
//! to exported interfaces.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::interface::InterfaceDescription;
use crate::message::{Message, MessageKind};
use crate::org_freedesktop_dbus as fdo;
use crate::signature::SignatureBuf;
use crate::value::Value;

/// How subscription paths are matched against the path a signal was emitted
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMatch {
    /// The emitting path must equal the subscribed path.
    #[default]
    Exact,
    /// The emitting path must equal the subscribed path or live under it in
    /// the object hierarchy.
    ExactOrPrefix,
}

impl PathMatch {
    fn matches(self, subscribed: &str, emitted: &str) -> bool {
        match self {
            PathMatch::Exact => subscribed == emitted,
            PathMatch::ExactOrPrefix => {
                emitted == subscribed
                    || subscribed == "/"
                    || emitted
                        .strip_prefix(subscribed)
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

/// A handle to an active signal subscription.
///
/// Dropping the handle does not release the subscription; call
/// [`Subscription::unsubscribe`] to stop delivery.
#[derive(Clone)]
pub struct Subscription {
    live: Arc<AtomicBool>,
}

impl Subscription {
    /// Release the subscription. No callback runs after this returns, even
    /// for signals already received and awaiting dispatch.
    pub fn unsubscribe(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Test if the subscription is still active.
    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

type SignalCallback = dyn Fn(&[Value]) + Send + Sync;

struct SignalEntry {
    path: String,
    interface: String,
    member: String,
    live: Arc<AtomicBool>,
    callback: Arc<SignalCallback>,
}

/// Dispatches signals to subscribers in registration order.
pub(crate) struct SignalRouter {
    path_match: PathMatch,
    entries: Mutex<Vec<SignalEntry>>,
}

impl SignalRouter {
    pub(crate) fn new(path_match: PathMatch) -> Self {
        Self {
            path_match,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        callback: Arc<SignalCallback>,
    ) -> Subscription {
        let live = Arc::new(AtomicBool::new(true));

        self.lock().push(SignalEntry {
            path: path.to_owned(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            live: live.clone(),
            callback,
        });

        Subscription { live }
    }

    /// Deliver a signal to every matching live subscriber.
    ///
    /// Callbacks run after the subscriber list lock has been released; a
    /// panicking callback is logged and does not stop the fan-out.
    pub(crate) fn deliver(&self, message: &Message) {
        let MessageKind::Signal { path, member } = &message.kind else {
            return;
        };

        let Some(interface) = message.interface.as_deref() else {
            return;
        };

        let matching = {
            let mut entries = self.lock();
            entries.retain(|e| e.live.load(Ordering::SeqCst));

            entries
                .iter()
                .filter(|e| {
                    e.interface == interface
                        && e.member == *member
                        && self.path_match.matches(&e.path, path)
                })
                .map(|e| (e.live.clone(), e.callback.clone()))
                .collect::<Vec<_>>()
        };

        for (live, callback) in matching {
            // Release may have raced in since the list was snapshotted.
            if !live.load(Ordering::SeqCst) {
                continue;
            }

            if panic::catch_unwind(AssertUnwindSafe(|| callback(&message.body))).is_err() {
                tracing::error!(member = member.as_str(), interface, "signal subscriber panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SignalEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// An error returned by an exported method handler, sent back to the caller
/// as a D-Bus error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    name: String,
    message: String,
}

impl MethodError {
    /// Construct a new error with a D-Bus error name and a human readable
    /// message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// A generic failure, `org.freedesktop.DBus.Error.Failed`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(fdo::ERROR_FAILED, message)
    }

    /// The D-Bus error name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

type MethodHandler = Arc<dyn Fn(Vec<Value>) -> Result<Vec<Value>, MethodError> + Send + Sync>;

/// The handlers backing an exported interface, keyed by method name.
///
/// # Examples
///
/// ```
/// use wirebus::{MethodHandlers, Value};
///
/// let handlers = MethodHandlers::new().with("Echo", |args| Ok(args));
/// ```
#[derive(Default)]
pub struct MethodHandlers {
    handlers: HashMap<String, MethodHandler>,
}

impl MethodHandlers {
    /// Construct an empty set of handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for the given method.
    pub fn with(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(Vec<Value>) -> Result<Vec<Value>, MethodError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }
}

/// The outcome of dispatching an incoming method call to the export
/// registry.
pub(crate) enum Dispatch {
    /// A successful reply with the given signature and body.
    Reply(SignatureBuf, Vec<Value>),
    /// An error reply.
    Error(MethodError),
}

struct ExportedInterface {
    description: InterfaceDescription,
    handlers: HashMap<String, MethodHandler>,
}

/// The exported objects of a connection, keyed by path.
pub(crate) struct ExportRegistry {
    objects: Mutex<HashMap<String, HashMap<String, ExportedInterface>>>,
}

impl ExportRegistry {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(
        &self,
        path: &str,
        description: InterfaceDescription,
        handlers: MethodHandlers,
    ) {
        self.lock().entry(path.to_owned()).or_default().insert(
            description.name.clone(),
            ExportedInterface {
                description,
                handlers: handlers.handlers,
            },
        );
    }

    pub(crate) fn remove(&self, path: &str) {
        self.lock().remove(path);
    }

    /// Dispatch an incoming method call. The handler itself runs after the
    /// registry lock has been released.
    pub(crate) fn dispatch(&self, call: &Message) -> Dispatch {
        let MessageKind::MethodCall { path, member } = &call.kind else {
            return Dispatch::Error(MethodError::failed("not a method call"));
        };

        let looked_up = {
            let objects = self.lock();

            let Some(object) = objects.get(path) else {
                return Dispatch::Error(MethodError::new(
                    fdo::ERROR_UNKNOWN_OBJECT,
                    format!("no object exported at path {path}"),
                ));
            };

            if call.interface.as_deref() == Some(fdo::INTROSPECTABLE)
                && member == "Introspect"
            {
                return Dispatch::Reply(
                    SignatureBuf::from_string_unchecked("s".into()),
                    vec![Value::String(introspection_xml(object))],
                );
            }

            match self.find_method(object, call.interface.as_deref(), member) {
                Ok((handler, method)) => {
                    if *call.signature != *method.in_signature() {
                        return Dispatch::Error(MethodError::new(
                            fdo::ERROR_INVALID_ARGS,
                            format!(
                                "expected signature `{}`, got `{}`",
                                method.in_signature(),
                                call.signature
                            ),
                        ));
                    }

                    (handler, method.out_signature().to_owned())
                }
                Err(error) => return Dispatch::Error(error),
            }
        };

        let (handler, out_signature) = looked_up;
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(call.body.clone())));

        match result {
            Ok(Ok(body)) => Dispatch::Reply(out_signature, body),
            Ok(Err(error)) => Dispatch::Error(error),
            Err(..) => {
                tracing::error!(member = member.as_str(), "exported method handler panicked");
                Dispatch::Error(MethodError::failed("method handler panicked"))
            }
        }
    }

    fn find_method(
        &self,
        object: &HashMap<String, ExportedInterface>,
        interface: Option<&str>,
        member: &str,
    ) -> Result<(MethodHandler, crate::interface::MethodDescription), MethodError> {
        let candidates: Vec<&ExportedInterface> = match interface {
            Some(name) => match object.get(name) {
                Some(exported) => vec![exported],
                None => {
                    return Err(MethodError::new(
                        fdo::ERROR_UNKNOWN_INTERFACE,
                        format!("no interface {name} on this object"),
                    ));
                }
            },
            None => object.values().collect(),
        };

        for exported in candidates {
            if let (Some(handler), Some(method)) = (
                exported.handlers.get(member),
                exported.description.method(member),
            ) {
                return Ok((handler.clone(), method.clone()));
            }
        }

        Err(MethodError::new(
            fdo::ERROR_UNKNOWN_METHOD,
            format!("no method {member} on this object"),
        ))
    }

    /// Test if the path has any exports, used to decide whether an emitted
    /// signal names a declared member.
    pub(crate) fn description(
        &self,
        path: &str,
        interface: &str,
    ) -> Option<InterfaceDescription> {
        self.lock()
            .get(path)?
            .get(interface)
            .map(|e| e.description.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, ExportedInterface>>> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn introspection_xml(object: &HashMap<String, ExportedInterface>) -> String {
    let mut out = String::from(
        "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n<node>\n",
    );

    let mut names: Vec<&String> = object.keys().collect();
    names.sort();

    for name in names {
        object[name].description.write_xml(&mut out);
    }

    out.push_str("</node>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InterfaceBuilder;
    use std::num::NonZeroU32;

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn tick(path: &str) -> Message {
        Message::signal(path, "Tick", serial(1))
            .with_interface("org.example.Clock")
            .with_body("s", vec![Value::from("now")])
            .unwrap()
    }

    #[test]
    fn fan_out_in_registration_order() {
        let router = SignalRouter::new(PathMatch::Exact);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            router.subscribe(
                "/clock",
                "org.example.Clock",
                "Tick",
                Arc::new(move |_| seen.lock().unwrap().push(n)),
            );
        }

        router.deliver(&tick("/clock"));
        assert_eq!(*seen.lock().unwrap(), [0, 1, 2]);
    }

    #[test]
    fn unsubscribed_callback_not_invoked() {
        let router = SignalRouter::new(PathMatch::Exact);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        let sub = router.subscribe(
            "/clock",
            "org.example.Clock",
            "Tick",
            Arc::new(move |_| seen2.lock().unwrap().push("a")),
        );

        let seen3 = seen.clone();
        router.subscribe(
            "/clock",
            "org.example.Clock",
            "Tick",
            Arc::new(move |_| seen3.lock().unwrap().push("b")),
        );

        sub.unsubscribe();
        assert!(!sub.is_active());

        router.deliver(&tick("/clock"));
        assert_eq!(*seen.lock().unwrap(), ["b"]);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_fan_out() {
        let router = SignalRouter::new(PathMatch::Exact);
        let seen = Arc::new(Mutex::new(Vec::new()));

        router.subscribe(
            "/clock",
            "org.example.Clock",
            "Tick",
            Arc::new(|_| panic!("boom")),
        );

        let seen2 = seen.clone();
        router.subscribe(
            "/clock",
            "org.example.Clock",
            "Tick",
            Arc::new(move |_| seen2.lock().unwrap().push("ok")),
        );

        router.deliver(&tick("/clock"));
        assert_eq!(*seen.lock().unwrap(), ["ok"]);
    }

    #[test]
    fn path_matching() {
        assert!(PathMatch::Exact.matches("/a", "/a"));
        assert!(!PathMatch::Exact.matches("/a", "/a/b"));

        assert!(PathMatch::ExactOrPrefix.matches("/a", "/a"));
        assert!(PathMatch::ExactOrPrefix.matches("/a", "/a/b"));
        assert!(PathMatch::ExactOrPrefix.matches("/", "/a/b"));
        assert!(!PathMatch::ExactOrPrefix.matches("/a", "/ab"));
    }

    fn clock_registry() -> ExportRegistry {
        let registry = ExportRegistry::new();

        let description = InterfaceBuilder::new("org.example.Clock")
            .method("Echo", "s", "s")
            .unwrap()
            .signal("Tick", "s")
            .unwrap()
            .build();

        let handlers = MethodHandlers::new().with("Echo", Ok);
        registry.insert("/clock", description, handlers);
        registry
    }

    fn call(path: &str, interface: Option<&str>, member: &str) -> Message {
        let mut m = Message::method_call(path, member, serial(1));

        if let Some(interface) = interface {
            m = m.with_interface(interface);
        }

        m.with_body("s", vec![Value::from("hello")]).unwrap()
    }

    #[test]
    fn dispatch_reply() {
        let registry = clock_registry();

        let outcome = registry.dispatch(&call("/clock", Some("org.example.Clock"), "Echo"));
        let Dispatch::Reply(signature, body) = outcome else {
            panic!("expected a reply");
        };

        assert_eq!(signature, "s");
        assert_eq!(body, [Value::from("hello")]);
    }

    #[test]
    fn dispatch_without_interface() {
        let registry = clock_registry();

        let outcome = registry.dispatch(&call("/clock", None, "Echo"));
        assert!(matches!(outcome, Dispatch::Reply(..)));
    }

    #[test]
    fn dispatch_errors() {
        let registry = clock_registry();

        let Dispatch::Error(error) = registry.dispatch(&call("/missing", None, "Echo")) else {
            panic!("expected an error");
        };
        assert_eq!(error.name(), fdo::ERROR_UNKNOWN_OBJECT);

        let Dispatch::Error(error) =
            registry.dispatch(&call("/clock", Some("org.example.Other"), "Echo"))
        else {
            panic!("expected an error");
        };
        assert_eq!(error.name(), fdo::ERROR_UNKNOWN_INTERFACE);

        let Dispatch::Error(error) =
            registry.dispatch(&call("/clock", Some("org.example.Clock"), "Nope"))
        else {
            panic!("expected an error");
        };
        assert_eq!(error.name(), fdo::ERROR_UNKNOWN_METHOD);
    }

    #[test]
    fn dispatch_signature_mismatch() {
        let registry = clock_registry();

        let bad = Message::method_call("/clock", "Echo", serial(1))
            .with_interface("org.example.Clock")
            .with_body("u", vec![Value::Uint32(1)])
            .unwrap();

        let Dispatch::Error(error) = registry.dispatch(&bad) else {
            panic!("expected an error");
        };
        assert_eq!(error.name(), fdo::ERROR_INVALID_ARGS);
    }

    #[test]
    fn dispatch_introspect() {
        let registry = clock_registry();

        let introspect = Message::method_call("/clock", "Introspect", serial(1))
            .with_interface(fdo::INTROSPECTABLE);

        let Dispatch::Reply(signature, body) = registry.dispatch(&introspect) else {
            panic!("expected a reply");
        };

        assert_eq!(signature, "s");
        let xml = body[0].as_str().unwrap();
        assert!(xml.contains("<interface name=\"org.example.Clock\">"));
        assert!(xml.contains("<method name=\"Echo\">"));
    }
}
