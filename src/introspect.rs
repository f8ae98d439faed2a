//! Parsing of introspection XML into interface descriptions.
//!
//! The parser is a small stack machine over the XML token stream. It
//! recognizes `node`, `interface`, `method`, `signal`, `property` and `arg`
//! elements; anything else, including nested child nodes and annotations,
//! is skipped rather than rejected since buses and services embed all kinds
//! of extensions in their introspection data.

use std::collections::BTreeMap;

use xmlparser::{ElementEnd, Token};

use crate::error::{Error, ErrorKind, Result};
use crate::interface::{
    InterfaceDescription, MethodDescription, PropertyAccess, PropertyDescription,
};
use crate::signature::SignatureBuf;

/// Parse an introspection document into the interfaces it describes,
/// keyed by interface name.
pub(crate) fn parse_document(xml: &str) -> Result<BTreeMap<String, InterfaceDescription>> {
    let tokenizer = xmlparser::Tokenizer::from(xml);

    let mut stack: Vec<State> = Vec::new();
    let mut interfaces = BTreeMap::new();

    for token in tokenizer {
        let token = token.map_err(|error| parse_error(format_args!("{error}")))?;

        match token {
            Token::ElementStart { local, .. } => {
                if let Some(State::Skip(depth)) = stack.last_mut() {
                    *depth += 1;
                    continue;
                }

                match (stack.last(), local.as_str()) {
                    (None, "node") => stack.push(State::Node),
                    (Some(State::Node), "interface") => {
                        stack.push(State::Interface(InterfaceAcc::default()));
                    }
                    (Some(State::Interface(..)), "method") => {
                        stack.push(State::Method(MemberAcc::default()));
                    }
                    (Some(State::Interface(..)), "signal") => {
                        stack.push(State::Signal(MemberAcc::default()));
                    }
                    (Some(State::Interface(..)), "property") => {
                        stack.push(State::Property(PropertyAcc::default()));
                    }
                    (Some(State::Method(..) | State::Signal(..)), "arg") => {
                        stack.push(State::Arg(ArgAcc::default()));
                    }
                    _ => stack.push(State::Skip(0)),
                }
            }
            Token::ElementEnd { end, .. } => {
                if matches!(end, ElementEnd::Open) {
                    continue;
                }

                if let Some(State::Skip(depth)) = stack.last_mut() {
                    if *depth > 0 {
                        *depth -= 1;
                        continue;
                    }
                }

                let Some(top) = stack.pop() else {
                    return Err(parse_error(format_args!("unbalanced element end")));
                };

                fold(&mut stack, &mut interfaces, top)?;
            }
            Token::Attribute { local, value, .. } => {
                let (name, value) = (local.as_str(), value.as_str());

                match stack.last_mut() {
                    Some(State::Interface(acc)) if name == "name" => {
                        acc.name = Some(value.to_owned());
                    }
                    Some(State::Method(acc) | State::Signal(acc)) if name == "name" => {
                        acc.name = Some(value.to_owned());
                    }
                    Some(State::Property(acc)) => match name {
                        "name" => acc.name = Some(value.to_owned()),
                        "type" => acc.ty = Some(value.to_owned()),
                        "access" => acc.access = PropertyAccess::from_xml(value),
                        _ => {}
                    },
                    Some(State::Arg(acc)) => match name {
                        "type" => acc.ty = Some(value.to_owned()),
                        "direction" => acc.out = value == "out",
                        _ => {}
                    },
                    _ => {}
                }
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(parse_error(format_args!("unterminated element")));
    }

    Ok(interfaces)
}

fn fold(
    stack: &mut [State],
    interfaces: &mut BTreeMap<String, InterfaceDescription>,
    top: State,
) -> Result<()> {
    match (stack.last_mut(), top) {
        (_, State::Skip(..)) => {}
        (None, State::Node) => {}
        (Some(State::Node), State::Interface(acc)) => {
            let Some(name) = acc.name else {
                return Err(parse_error(format_args!("interface without a name")));
            };

            interfaces.insert(
                name.clone(),
                InterfaceDescription {
                    name,
                    methods: acc.methods,
                    signals: acc.signals,
                    properties: acc.properties,
                },
            );
        }
        (Some(State::Interface(interface)), State::Method(acc)) => {
            let Some(name) = acc.name else {
                return Err(parse_error(format_args!("method without a name")));
            };

            interface.methods.insert(
                name,
                MethodDescription {
                    in_signature: signature(&acc.in_signature)?,
                    out_signature: signature(&acc.out_signature)?,
                },
            );
        }
        (Some(State::Interface(interface)), State::Signal(acc)) => {
            let Some(name) = acc.name else {
                return Err(parse_error(format_args!("signal without a name")));
            };

            // Signal args all travel in the same direction; the `in`
            // accumulator holds those without an explicit direction.
            let mut combined = acc.in_signature;
            combined.push_str(&acc.out_signature);
            interface.signals.insert(name, signature(&combined)?);
        }
        (Some(State::Interface(interface)), State::Property(acc)) => {
            let (Some(name), Some(ty)) = (acc.name, acc.ty) else {
                return Err(parse_error(format_args!("property without name or type")));
            };

            interface.properties.insert(
                name,
                PropertyDescription {
                    signature: signature(&ty)?,
                    access: acc.access.unwrap_or(PropertyAccess::Read),
                },
            );
        }
        (Some(State::Method(member) | State::Signal(member)), State::Arg(acc)) => {
            let Some(ty) = acc.ty else {
                return Err(parse_error(format_args!("arg without a type")));
            };

            if acc.out {
                member.out_signature.push_str(&ty);
            } else {
                member.in_signature.push_str(&ty);
            }
        }
        _ => return Err(parse_error(format_args!("element in unexpected position"))),
    }

    Ok(())
}

fn signature(signature: &str) -> Result<SignatureBuf> {
    SignatureBuf::new(signature)
        .map_err(|error| parse_error(format_args!("invalid signature `{signature}`: {error}")))
}

fn parse_error(reason: std::fmt::Arguments<'_>) -> Error {
    ErrorKind::IntrospectionParse(reason.to_string().into()).into()
}

enum State {
    Node,
    Interface(InterfaceAcc),
    Method(MemberAcc),
    Signal(MemberAcc),
    Property(PropertyAcc),
    Arg(ArgAcc),
    Skip(usize),
}

#[derive(Default)]
struct InterfaceAcc {
    name: Option<String>,
    methods: BTreeMap<String, MethodDescription>,
    signals: BTreeMap<String, SignatureBuf>,
    properties: BTreeMap<String, PropertyDescription>,
}

#[derive(Default)]
struct MemberAcc {
    name: Option<String>,
    in_signature: String,
    out_signature: String,
}

#[derive(Default)]
struct PropertyAcc {
    name: Option<String>,
    ty: Option<String>,
    access: Option<PropertyAccess>,
}

#[derive(Default)]
struct ArgAcc {
    ty: Option<String>,
    out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
        <node>
          <interface name="org.example.Clock">
            <method name="SetAlarm">
              <arg name="when" type="s" direction="in"/>
              <arg name="repeat" type="t"/>
              <arg name="armed" type="b" direction="out"/>
            </method>
            <signal name="Tick">
              <arg name="time" type="s"/>
            </signal>
            <property name="TimeZone" type="s" access="read"/>
          </interface>
          <interface name="org.freedesktop.DBus.Peer">
            <method name="Ping"/>
          </interface>
        </node>
    "#;

    #[test]
    fn full_document() {
        let interfaces = parse_document(DOCUMENT).unwrap();
        assert_eq!(interfaces.len(), 2);

        let clock = &interfaces["org.example.Clock"];
        let method = clock.method("SetAlarm").unwrap();
        assert_eq!(method.in_signature(), "st");
        assert_eq!(method.out_signature(), "b");
        assert_eq!(clock.signal("Tick").map(|s| s.as_str()), Some("s"));
        assert_eq!(
            clock.property("TimeZone").map(|p| p.access()),
            Some(PropertyAccess::Read)
        );

        let peer = &interfaces["org.freedesktop.DBus.Peer"];
        let ping = peer.method("Ping").unwrap();
        assert!(ping.in_signature().is_empty());
        assert!(ping.out_signature().is_empty());
    }

    #[test]
    fn unknown_elements_skipped() {
        let interfaces = parse_document(
            r#"
            <node>
              <node name="child"/>
              <interface name="org.example.Iface">
                <annotation name="org.example.Note" value="yes"/>
                <method name="Go">
                  <annotation name="deprecated" value="true"/>
                  <arg type="u" direction="out"/>
                </method>
                <vendor:extension xmlns:vendor="urn:x"><inner/></vendor:extension>
              </interface>
            </node>
            "#,
        )
        .unwrap();

        let iface = &interfaces["org.example.Iface"];
        assert_eq!(iface.method("Go").unwrap().out_signature(), "u");
    }

    #[test]
    fn malformed_xml() {
        let error = parse_document("<node><interface").unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::IntrospectionParse(..)
        ));
    }

    #[test]
    fn invalid_arg_type() {
        let error = parse_document(
            r#"
            <node>
              <interface name="x.y">
                <method name="Bad"><arg type="a{" direction="in"/></method>
              </interface>
            </node>
            "#,
        )
        .unwrap_err();

        assert!(error.to_string().contains("Malformed introspection XML"));
    }

    #[test]
    fn empty_document() {
        let interfaces = parse_document("<node/>").unwrap();
        assert!(interfaces.is_empty());
    }
}
