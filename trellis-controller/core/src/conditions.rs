use chrono::{DateTime, Utc};

/// Machine-readable reason codes recorded on status conditions.
pub mod reason {
    pub const VALID: &str = "Valid";
    pub const HOSTNAME_CONFLICT: &str = "HostnameConflict";
    pub const ROUTE_ERROR: &str = "RouteError";
    pub const TLS_ERROR: &str = "TLSError";
    pub const SERVICE_ERROR: &str = "ServiceError";
    pub const AUTH_ERROR: &str = "AuthError";
    pub const SPEC_ERROR: &str = "SpecError";
}

/// Identifies one input resource a condition applies to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

// === impl ObjectRef ===

impl ObjectRef {
    pub fn new(kind: &'static str, namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// The validity condition recorded for one input resource by a build pass.
///
/// Builds return these as plain data; how (or whether) they are persisted
/// onto the resources is up to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub object: ObjectRef,
    pub valid: bool,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// === impl StatusUpdate ===

impl StatusUpdate {
    pub fn valid(object: ObjectRef, message: impl ToString, timestamp: DateTime<Utc>) -> Self {
        Self {
            object,
            valid: true,
            reason: reason::VALID.to_string(),
            message: message.to_string(),
            timestamp,
        }
    }

    pub fn invalid(
        object: ObjectRef,
        reason: impl ToString,
        message: impl ToString,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            object,
            valid: false,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp,
        }
    }
}
