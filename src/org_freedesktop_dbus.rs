//! Types and constants for interacting with the `org.freedesktop.DBus`
//! message bus service.

/// The well-known name of the message bus itself.
pub const DESTINATION: &str = "org.freedesktop.DBus";

/// The object path of the message bus.
pub const PATH: &str = "/org/freedesktop/DBus";

/// The interface of the message bus.
pub const INTERFACE: &str = "org.freedesktop.DBus";

/// The standard introspection interface.
pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

/// A generic failure.
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

/// The invoked method does not exist on the object.
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// The addressed object does not exist.
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

/// The addressed interface does not exist on the object.
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";

/// The arguments of a call did not match the method's signature.
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

raw_set! {
    /// Flags to pass to `RequestName`.
    #[repr(u32)]
    pub enum NameFlag {
        /// No flags set.
        NONE = 0,
        /// Allow another application to take over the name.
        ALLOW_REPLACEMENT = 1,
        /// Attempt to take over the name if it already has an owner.
        REPLACE_EXISTING = 2,
        /// Do not queue for the name if it cannot be acquired immediately.
        DO_NOT_QUEUE = 4,
    }
}

raw_enum! {
    /// The reply of a `RequestName` call.
    #[repr(u32)]
    pub enum NameReply {
        /// The caller is now the primary owner of the name.
        PRIMARY_OWNER = 1,
        /// The name already had an owner and the caller has been placed in
        /// a queue.
        IN_QUEUE = 2,
        /// The name already has an owner and queueing was not requested.
        EXISTS = 3,
        /// The caller was already the owner of the name.
        ALREADY_OWNER = 4,
    }
}

raw_enum! {
    /// The reply of a `ReleaseName` call.
    #[repr(u32)]
    pub enum ReleaseNameReply {
        /// The name has been released.
        RELEASED = 1,
        /// The name does not exist.
        NON_EXISTENT = 2,
        /// The caller was not the owner of the name.
        NOT_OWNER = 3,
    }
}
