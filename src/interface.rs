//! Descriptions of D-Bus interfaces.
//!
//! A description is the schema a proxy checks calls against and an exported
//! object answers introspection with. Descriptions come from parsing
//! introspection XML or from an [`InterfaceBuilder`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::Result;
use crate::signature::{Signature, SignatureBuf};

/// The description of a method: its input and output signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescription {
    pub(crate) in_signature: SignatureBuf,
    pub(crate) out_signature: SignatureBuf,
}

impl MethodDescription {
    /// The signature of the method's arguments.
    pub fn in_signature(&self) -> &Signature {
        &self.in_signature
    }

    /// The signature of the method's return values.
    pub fn out_signature(&self) -> &Signature {
        &self.out_signature
    }
}

/// How a property may be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    /// The property can only be read.
    Read,
    /// The property can only be written.
    Write,
    /// The property can be read and written.
    ReadWrite,
}

impl PropertyAccess {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }

    pub(crate) fn from_xml(value: &str) -> Option<PropertyAccess> {
        match value {
            "read" => Some(PropertyAccess::Read),
            "write" => Some(PropertyAccess::Write),
            "readwrite" => Some(PropertyAccess::ReadWrite),
            _ => None,
        }
    }
}

/// The description of a property: its type and access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescription {
    pub(crate) signature: SignatureBuf,
    pub(crate) access: PropertyAccess,
}

impl PropertyDescription {
    /// The type of the property.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The access of the property.
    pub fn access(&self) -> PropertyAccess {
        self.access
    }
}

/// An immutable description of an interface: its methods, signals, and
/// properties.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDescription {
    pub(crate) name: String,
    pub(crate) methods: BTreeMap<String, MethodDescription>,
    pub(crate) signals: BTreeMap<String, SignatureBuf>,
    pub(crate) properties: BTreeMap<String, PropertyDescription>,
}

impl InterfaceDescription {
    /// The name of the interface.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&MethodDescription> {
        self.methods.get(name)
    }

    /// Look up the signature of a signal by name.
    pub fn signal(&self, name: &str) -> Option<&Signature> {
        self.signals.get(name).map(|s| &**s)
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&PropertyDescription> {
        self.properties.get(name)
    }

    /// Iterate over the methods of the interface.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &MethodDescription)> {
        self.methods.iter().map(|(name, m)| (name.as_str(), m))
    }

    /// Iterate over the signals of the interface.
    pub fn signals(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.signals.iter().map(|(name, s)| (name.as_str(), &**s))
    }

    /// Iterate over the properties of the interface.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyDescription)> {
        self.properties.iter().map(|(name, p)| (name.as_str(), p))
    }

    /// Write the interface as introspection XML.
    pub(crate) fn write_xml(&self, out: &mut String) {
        let _ = writeln!(out, "  <interface name=\"{}\">", self.name);

        for (name, method) in &self.methods {
            let _ = writeln!(out, "    <method name=\"{name}\">");

            for ty in method.in_signature.iter() {
                let _ = writeln!(out, "      <arg type=\"{ty}\" direction=\"in\"/>");
            }

            for ty in method.out_signature.iter() {
                let _ = writeln!(out, "      <arg type=\"{ty}\" direction=\"out\"/>");
            }

            let _ = writeln!(out, "    </method>");
        }

        for (name, signature) in &self.signals {
            let _ = writeln!(out, "    <signal name=\"{name}\">");

            for ty in signature.iter() {
                let _ = writeln!(out, "      <arg type=\"{ty}\"/>");
            }

            let _ = writeln!(out, "    </signal>");
        }

        for (name, property) in &self.properties {
            let _ = writeln!(
                out,
                "    <property name=\"{name}\" type=\"{}\" access=\"{}\"/>",
                property.signature,
                property.access.as_str()
            );
        }

        let _ = writeln!(out, "  </interface>");
    }
}

/// A builder for caller-supplied interface descriptions.
///
/// # Examples
///
/// ```
/// use wirebus::InterfaceBuilder;
///
/// let interface = InterfaceBuilder::new("org.example.Clock")
///     .method("SetAlarm", "st", "b")?
///     .signal("Tick", "s")?
///     .build();
///
/// assert_eq!(interface.name(), "org.example.Clock");
/// assert!(interface.signal("Tick").is_some());
/// # Ok::<_, wirebus::Error>(())
/// ```
pub struct InterfaceBuilder {
    interface: InterfaceDescription,
}

impl InterfaceBuilder {
    /// Construct a builder for an interface with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            interface: InterfaceDescription {
                name: name.into(),
                methods: BTreeMap::new(),
                signals: BTreeMap::new(),
                properties: BTreeMap::new(),
            },
        }
    }

    /// Declare a method with its input and output signatures.
    ///
    /// # Errors
    ///
    /// Errors if either signature is malformed.
    pub fn method(
        mut self,
        name: impl Into<String>,
        in_signature: &str,
        out_signature: &str,
    ) -> Result<Self> {
        self.interface.methods.insert(
            name.into(),
            MethodDescription {
                in_signature: SignatureBuf::new(in_signature)?,
                out_signature: SignatureBuf::new(out_signature)?,
            },
        );

        Ok(self)
    }

    /// Declare a signal with its body signature.
    ///
    /// # Errors
    ///
    /// Errors if the signature is malformed.
    pub fn signal(mut self, name: impl Into<String>, signature: &str) -> Result<Self> {
        self.interface
            .signals
            .insert(name.into(), SignatureBuf::new(signature)?);
        Ok(self)
    }

    /// Declare a property with its type and access.
    ///
    /// # Errors
    ///
    /// Errors if the signature is malformed.
    pub fn property(
        mut self,
        name: impl Into<String>,
        signature: &str,
        access: PropertyAccess,
    ) -> Result<Self> {
        self.interface.properties.insert(
            name.into(),
            PropertyDescription {
                signature: SignatureBuf::new(signature)?,
                access,
            },
        );

        Ok(self)
    }

    /// Build the immutable description.
    pub fn build(self) -> InterfaceDescription {
        self.interface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_lookups() {
        let interface = InterfaceBuilder::new("org.example.Clock")
            .method("SetAlarm", "st", "b")
            .unwrap()
            .signal("Tick", "s")
            .unwrap()
            .property("TimeZone", "s", PropertyAccess::Read)
            .unwrap()
            .build();

        let method = interface.method("SetAlarm").unwrap();
        assert_eq!(method.in_signature(), "st");
        assert_eq!(method.out_signature(), "b");

        assert_eq!(interface.signal("Tick").map(Signature::as_str), Some("s"));
        assert!(interface.signal("Tock").is_none());

        let property = interface.property("TimeZone").unwrap();
        assert_eq!(property.access(), PropertyAccess::Read);
    }

    #[test]
    fn invalid_signature_rejected() {
        assert!(InterfaceBuilder::new("org.example")
            .method("Bad", "a{s", "")
            .is_err());
    }

    #[test]
    fn xml_generation() {
        let interface = InterfaceBuilder::new("org.example.Clock")
            .method("SetAlarm", "st", "b")
            .unwrap()
            .signal("Tick", "s")
            .unwrap()
            .build();

        let mut out = String::new();
        interface.write_xml(&mut out);

        assert!(out.contains("<interface name=\"org.example.Clock\">"));
        assert!(out.contains("<method name=\"SetAlarm\">"));
        assert!(out.contains("<arg type=\"s\" direction=\"in\"/>"));
        assert!(out.contains("<arg type=\"t\" direction=\"in\"/>"));
        assert!(out.contains("<arg type=\"b\" direction=\"out\"/>"));
        assert!(out.contains("<signal name=\"Tick\">"));
    }
}
