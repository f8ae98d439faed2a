//! Connection tests against a scripted peer on an in-memory stream.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use wirebus::{
    frame_message, Connection, ConnectionBuilder, Deframer, InterfaceBuilder, Message,
    MessageKind, MethodHandlers, Value,
};

/// The peer end of a connection under test. Speaks just enough of the
/// protocol to script both the message bus and remote services.
struct ScriptedBus {
    stream: DuplexStream,
    deframer: Deframer,
    next_serial: u32,
}

impl ScriptedBus {
    /// Answer the authentication handshake.
    async fn accept(stream: DuplexStream) -> Result<Self> {
        let mut bus = Self {
            stream,
            deframer: Deframer::new(),
            next_serial: 1,
        };

        if bus.stream.read_u8().await? != 0 {
            bail!("expected the leading NUL");
        }

        let line = bus.read_line().await?;

        if !line.starts_with("AUTH EXTERNAL ") {
            bail!("unexpected auth line: {line}");
        }

        bus.stream
            .write_all(b"OK 00112233445566778899aabbccddeeff\r\n")
            .await?;

        let line = bus.read_line().await?;

        if line != "BEGIN" {
            bail!("unexpected line after OK: {line}");
        }

        Ok(bus)
    }

    /// Answer the handshake and the implicit Hello call, assigning the
    /// given unique name.
    async fn accept_with_hello(stream: DuplexStream, unique: &str) -> Result<Self> {
        let mut bus = Self::accept(stream).await?;

        let hello = bus.read_message().await?;

        let MessageKind::MethodCall { member, .. } = hello.kind() else {
            bail!("expected the Hello call");
        };

        if member != "Hello" {
            bail!("expected Hello, got {member}");
        }

        let reply = Message::method_return(bus.serial(), hello.serial())
            .with_body("s", vec![Value::from(unique)])?;
        bus.send(&reply).await?;

        Ok(bus)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();

        loop {
            let b = self.stream.read_u8().await?;

            if b == b'\n' {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                return Ok(String::from_utf8(line)?);
            }

            line.push(b);
        }
    }

    async fn read_message(&mut self) -> Result<Message> {
        let mut buf = [0u8; 1024];

        loop {
            if let Some(message) = self.deframer.next()? {
                return Ok(message);
            }

            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                bail!("peer closed the stream");
            }

            self.deframer.feed(&buf[..n]);
        }
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        self.stream.write_all(&frame_message(message)?).await?;
        Ok(())
    }

    fn serial(&mut self) -> NonZeroU32 {
        let serial = NonZeroU32::new(self.next_serial).unwrap();
        self.next_serial += 1;
        serial
    }
}

async fn connected(unique: &str) -> Result<(Connection, ScriptedBus)> {
    connected_with(unique, ConnectionBuilder::new()).await
}

async fn connected_with(
    unique: &str,
    builder: ConnectionBuilder,
) -> Result<(Connection, ScriptedBus)> {
    let (client, server) = tokio::io::duplex(4096);

    let unique = unique.to_owned();
    let peer = tokio::spawn(async move { ScriptedBus::accept_with_hello(server, &unique).await });

    let connection = builder.from_stream(client).await?;
    let bus = peer.await??;
    Ok((connection, bus))
}

#[tokio::test]
async fn handshake_and_hello() -> Result<()> {
    let (connection, _bus) = connected(":1.5").await?;

    assert_eq!(connection.unique_name(), Some(":1.5"));
    assert_eq!(connection.server_guid(), "00112233445566778899aabbccddeeff");
    assert!(!connection.is_closed());
    Ok(())
}

#[tokio::test]
async fn replies_correlate_out_of_order() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;

    let first = connection.method_call(
        "org.example",
        "/obj",
        Some("org.example.Iface"),
        "First",
        "",
        vec![],
    );
    let second = connection.method_call(
        "org.example",
        "/obj",
        Some("org.example.Iface"),
        "Second",
        "",
        vec![],
    );

    let peer = async {
        let a = bus.read_message().await?;
        let b = bus.read_message().await?;

        // Serials after the Hello call, strictly increasing.
        assert!(b.serial() > a.serial());

        // Answer in reverse order.
        let reply = Message::method_return(bus.serial(), b.serial())
            .with_body("s", vec![Value::from("second")])?;
        bus.send(&reply).await?;

        let reply = Message::method_return(bus.serial(), a.serial())
            .with_body("s", vec![Value::from("first")])?;
        bus.send(&reply).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (first, second, peer) = tokio::join!(first, second, peer);
    peer?;

    assert_eq!(first?, [Value::from("first")]);
    assert_eq!(second?, [Value::from("second")]);
    Ok(())
}

#[tokio::test]
async fn call_times_out_and_late_reply_is_dropped() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;
    let proxy = connection.proxy_unchecked("org.example", "/obj", "org.example.Iface");

    let call = proxy.call_with_timeout("Slow", vec![], Duration::from_millis(50));

    let peer = async {
        let slow = bus.read_message().await?;
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Too late; the caller has already given up on this serial.
        let reply = Message::method_return(bus.serial(), slow.serial())
            .with_body("s", vec![Value::from("late")])?;
        bus.send(&reply).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (result, peer) = tokio::join!(call, peer);
    peer?;
    assert!(result.unwrap_err().is_timeout());

    // The connection remains usable after a timed out call.
    let next = proxy.call("Fast", vec![]);

    let peer = async {
        let fast = bus.read_message().await?;
        let reply = Message::method_return(bus.serial(), fast.serial())
            .with_body("s", vec![Value::from("ok")])?;
        bus.send(&reply).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (result, peer) = tokio::join!(next, peer);
    peer?;
    assert_eq!(result?, [Value::from("ok")]);
    Ok(())
}

#[tokio::test]
async fn signals_fan_out_in_subscription_order() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;
    let proxy = connection.proxy_unchecked("org.example", "/clock", "org.example.Clock");

    let seen = Arc::new(Mutex::new(Vec::new()));

    for n in 0..3 {
        let seen = seen.clone();
        proxy
            .subscribe("Tick", move |body| {
                let time = body[0].as_str().unwrap_or("").to_owned();
                seen.lock().unwrap().push((n, time));
            })
            .await?;
    }

    // One AddMatch for the three subscriptions on the same interface.
    let add_match = bus.read_message().await?;
    let MessageKind::MethodCall { member, .. } = add_match.kind() else {
        bail!("expected AddMatch");
    };
    assert_eq!(member, "AddMatch");

    let signal = Message::signal("/clock", "Tick", bus.serial())
        .with_interface("org.example.Clock")
        .with_body("s", vec![Value::from("noon")])?;
    bus.send(&signal).await?;

    for _ in 0..100 {
        if seen.lock().unwrap().len() == 3 {
            break;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        [
            (0, "noon".to_owned()),
            (1, "noon".to_owned()),
            (2, "noon".to_owned()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn prefix_matching_covers_subtree_paths() -> Result<()> {
    let builder = ConnectionBuilder::new().path_match(wirebus::PathMatch::ExactOrPrefix);
    let (connection, mut bus) = connected_with(":1.5", builder).await?;
    let proxy = connection.proxy_unchecked("org.example", "/clock", "org.example.Clock");

    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen2 = seen.clone();
    proxy
        .subscribe("Tick", move |body| {
            seen2
                .lock()
                .unwrap()
                .push(body[0].as_str().unwrap_or("").to_owned());
        })
        .await?;

    bus.read_message().await.context("AddMatch")?;

    let signal = Message::signal("/clock/inner", "Tick", bus.serial())
        .with_interface("org.example.Clock")
        .with_body("s", vec![Value::from("nested")])?;
    bus.send(&signal).await?;

    for _ in 0..100 {
        if !seen.lock().unwrap().is_empty() {
            break;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(*seen.lock().unwrap(), ["nested"]);
    Ok(())
}

#[tokio::test]
async fn unsubscribed_callback_stays_silent() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;
    let proxy = connection.proxy_unchecked("org.example", "/clock", "org.example.Clock");

    let seen = Arc::new(Mutex::new(0u32));

    let seen2 = seen.clone();
    let subscription = proxy
        .subscribe("Tick", move |_| *seen2.lock().unwrap() += 1)
        .await?;

    bus.read_message().await.context("AddMatch")?;
    subscription.unsubscribe();

    let signal = Message::signal("/clock", "Tick", bus.serial())
        .with_interface("org.example.Clock")
        .with_body("s", vec![Value::from("noon")])?;
    bus.send(&signal).await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), 0);
    Ok(())
}

#[tokio::test]
async fn exported_interface_answers_calls() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;

    let description = InterfaceBuilder::new("org.example.Echo")
        .method("Echo", "s", "s")?
        .build();

    let handlers = MethodHandlers::new().with("Echo", Ok);
    connection.export("/echo", description, handlers)?;

    let call = Message::method_call("/echo", "Echo", bus.serial())
        .with_interface("org.example.Echo")
        .with_destination(":1.5")
        .with_sender(":1.9")
        .with_body("s", vec![Value::from("hello")])?;
    bus.send(&call).await?;

    let reply = bus.read_message().await?;
    assert_eq!(
        reply.kind(),
        &MessageKind::MethodReturn {
            reply_serial: call.serial(),
        }
    );
    assert_eq!(reply.destination(), Some(":1.9"));
    assert_eq!(reply.body(), [Value::from("hello")]);
    Ok(())
}

#[tokio::test]
async fn unknown_method_gets_an_error_reply() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;

    let description = InterfaceBuilder::new("org.example.Echo")
        .method("Echo", "s", "s")?
        .build();

    connection.export("/echo", description, MethodHandlers::new().with("Echo", Ok))?;

    let call = Message::method_call("/echo", "Missing", bus.serial())
        .with_interface("org.example.Echo")
        .with_sender(":1.9")
        .with_body("", vec![])?;
    bus.send(&call).await?;

    let reply = bus.read_message().await?;

    let MessageKind::Error {
        error_name,
        reply_serial,
    } = reply.kind()
    else {
        bail!("expected an error reply");
    };

    assert_eq!(error_name, "org.freedesktop.DBus.Error.UnknownMethod");
    assert_eq!(*reply_serial, call.serial());
    Ok(())
}

#[tokio::test]
async fn exported_object_emits_signals() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;

    let description = InterfaceBuilder::new("org.example.Clock")
        .signal("Tick", "s")?
        .build();

    let object = connection.export("/clock", description, MethodHandlers::new())?;
    object.emit("Tick", vec![Value::from("noon")]).await?;

    let signal = bus.read_message().await?;
    assert_eq!(
        signal.kind(),
        &MessageKind::Signal {
            path: "/clock".into(),
            member: "Tick".into(),
        }
    );
    assert_eq!(signal.interface(), Some("org.example.Clock"));
    assert_eq!(signal.sender(), Some(":1.5"));
    assert_eq!(signal.body(), [Value::from("noon")]);

    let error = object.emit("Tock", vec![]).await.unwrap_err();
    assert!(error.is_unknown_signal());
    Ok(())
}

#[tokio::test]
async fn disconnect_fails_every_pending_call() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;

    let first = connection.method_call("org.example", "/obj", None, "A", "", vec![]);
    let second = connection.method_call("org.example", "/obj", None, "B", "", vec![]);

    let peer = async {
        bus.read_message().await?;
        bus.read_message().await?;
        drop(bus);
        Ok::<_, anyhow::Error>(())
    };

    let (first, second, peer) = tokio::join!(first, second, peer);
    peer?;

    assert!(first.unwrap_err().is_connection_closed());
    assert!(second.unwrap_err().is_connection_closed());

    for _ in 0..100 {
        if connection.is_closed() {
            break;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(connection.is_closed());

    let error = connection
        .method_call("org.example", "/obj", None, "C", "", vec![])
        .await
        .unwrap_err();
    assert!(error.is_connection_closed());
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent() -> Result<()> {
    let (connection, _bus) = connected(":1.5").await?;

    connection.close().await;
    connection.close().await;
    assert!(connection.is_closed());

    let error = connection
        .method_call("org.example", "/obj", None, "A", "", vec![])
        .await
        .unwrap_err();
    assert!(error.is_connection_closed());
    Ok(())
}

#[tokio::test]
async fn export_is_rejected_after_close() -> Result<()> {
    let (connection, _bus) = connected(":1.5").await?;

    let description = InterfaceBuilder::new("org.example.Echo")
        .method("Echo", "s", "s")?
        .build();

    connection.close().await;

    let error = connection
        .export("/echo", description, MethodHandlers::new().with("Echo", Ok))
        .unwrap_err();
    assert!(error.is_connection_closed());

    let error = connection.unexport("/echo").unwrap_err();
    assert!(error.is_connection_closed());
    Ok(())
}

#[tokio::test]
async fn introspection_builds_checked_proxies() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;

    let xml = r#"
        <node>
          <interface name="org.example.Calc">
            <method name="Add">
              <arg type="i" direction="in"/>
              <arg type="i" direction="in"/>
              <arg type="i" direction="out"/>
            </method>
          </interface>
        </node>
    "#;

    let client = async {
        connection
            .get_proxy("org.example", "/calc", "org.example.Calc")
            .await
    };

    let peer = async {
        let introspect = bus.read_message().await?;

        let MessageKind::MethodCall { member, .. } = introspect.kind() else {
            bail!("expected Introspect");
        };
        assert_eq!(member, "Introspect");

        let reply = Message::method_return(bus.serial(), introspect.serial())
            .with_body("s", vec![Value::from(xml)])?;
        bus.send(&reply).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (proxy, peer) = tokio::join!(client, peer);
    peer?;
    let proxy = proxy?;

    // Arity is checked locally, before anything goes on the wire.
    let error = proxy.call("Add", vec![Value::Int32(1)]).await.unwrap_err();
    assert!(error.is_argument_mismatch());

    let error = proxy.call("Subtract", vec![]).await.unwrap_err();
    assert!(error.is_unknown_method());

    let call = proxy.call("Add", vec![Value::Int32(2), Value::Int32(3)]);

    let peer = async {
        let add = bus.read_message().await?;
        assert_eq!(add.signature(), "ii");

        let reply = Message::method_return(bus.serial(), add.serial())
            .with_body("i", vec![Value::Int32(5)])?;
        bus.send(&reply).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (result, peer) = tokio::join!(call, peer);
    peer?;
    assert_eq!(result?, [Value::Int32(5)]);
    Ok(())
}

#[tokio::test]
async fn remote_errors_carry_name_and_message() -> Result<()> {
    let (connection, mut bus) = connected(":1.5").await?;

    let call = connection.method_call("org.example", "/obj", None, "Fail", "", vec![]);

    let peer = async {
        let failing = bus.read_message().await?;

        let reply = Message::error("org.example.Error.Boom", bus.serial(), failing.serial())
            .with_body("s", vec![Value::from("it broke")])?;
        bus.send(&reply).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (result, peer) = tokio::join!(call, peer);
    peer?;

    let error = result.unwrap_err();
    assert_eq!(
        error.remote_error(),
        Some(("org.example.Error.Boom", "it broke"))
    );
    Ok(())
}
