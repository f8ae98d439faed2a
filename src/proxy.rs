//! Client-side proxies for remote interfaces.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::connection::ConnectionInner;
use crate::error::{ErrorKind, Result};
use crate::interface::InterfaceDescription;
use crate::router::Subscription;
use crate::value::Value;

/// A callable handle to one interface of a remote object.
///
/// A proxy built from an [`InterfaceDescription`] checks calls against the
/// description before anything goes on the wire; one built without a
/// description passes calls through as given.
///
/// The proxy holds no strong reference to the connection; once the
/// connection has been torn down its operations fail with a connection
/// closed error.
#[derive(Clone)]
pub struct Proxy {
    inner: Weak<ConnectionInner>,
    destination: String,
    path: String,
    interface: String,
    description: Option<InterfaceDescription>,
}

impl Proxy {
    pub(crate) fn new(
        inner: &Arc<ConnectionInner>,
        destination: String,
        path: String,
        interface: String,
        description: Option<InterfaceDescription>,
    ) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            destination,
            path,
            interface,
            description,
        }
    }

    /// The destination the proxy calls.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The path of the remote object.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The name of the interface.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The description the proxy checks calls against, if it has one.
    pub fn description(&self) -> Option<&InterfaceDescription> {
        self.description.as_ref()
    }

    /// Call a method and await its reply, with the connection's default
    /// timeout.
    ///
    /// # Errors
    ///
    /// Errors if the method or its arguments do not match the description,
    /// if the remote replies with an error, if the call times out, or if
    /// the connection goes away.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let inner = self.upgrade()?;
        let timeout = inner.default_timeout();
        self.call_inner(&inner, method, args, timeout).await
    }

    /// Call a method with an explicit timeout, overriding the connection's
    /// default.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let inner = self.upgrade()?;
        self.call_inner(&inner, method, args, Some(timeout)).await
    }

    async fn call_inner(
        &self,
        inner: &Arc<ConnectionInner>,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let signature = match &self.description {
            Some(description) => {
                let Some(known) = description.method(method) else {
                    return Err(ErrorKind::UnknownMethod(method.into()).into());
                };

                let arity = known.in_signature().iter().count();

                if args.len() != arity {
                    return Err(ErrorKind::ArgumentMismatch(
                        format!("{method} takes {arity} arguments, got {}", args.len()).into(),
                    )
                    .into());
                }

                known.in_signature().to_owned()
            }
            None => {
                // Without a description the signature follows the values.
                let mut signature = String::new();

                for arg in &args {
                    signature.push_str(arg.signature().as_str());
                }

                crate::SignatureBuf::new(&signature)?
            }
        };

        let reply = inner
            .invoke(
                &self.destination,
                &self.path,
                Some(&self.interface),
                method,
                &signature,
                args,
                timeout,
            )
            .await?;

        Ok(reply.into_body())
    }

    /// Subscribe to a signal of the remote interface.
    ///
    /// The callback runs on the connection's read task with the decoded
    /// signal body. The returned handle releases the subscription through
    /// [`Subscription::unsubscribe`].
    ///
    /// # Errors
    ///
    /// Errors if the description does not declare the signal, or if the
    /// connection has gone away.
    pub async fn subscribe(
        &self,
        signal: &str,
        callback: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        if let Some(description) = &self.description {
            if description.signal(signal).is_none() {
                return Err(ErrorKind::UnknownSignal(signal.into()).into());
            }
        }

        let inner = self.upgrade()?;
        inner.ensure_match(&self.path, &self.interface).await?;

        Ok(inner
            .router()
            .subscribe(&self.path, &self.interface, signal, Arc::new(callback)))
    }

    fn upgrade(&self) -> Result<Arc<ConnectionInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| ErrorKind::ConnectionClosed.into())
    }
}
