//! Identifiers for remote entities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified class name of a remote entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassKey {
    /// Schema name.
    pub schema: String,
    /// Class name within the schema.
    pub name: String,
}

impl ClassKey {
    /// Creates a new class key.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parses a `Schema.Class` string.
    ///
    /// Returns `None` if the string has no `.` separator.
    pub fn parse(qualified: &str) -> Option<Self> {
        let (schema, name) = qualified.split_once('.')?;
        Some(Self::new(schema, name))
    }

    /// Returns true if both schema and name are empty.
    pub fn is_empty(&self) -> bool {
        self.schema.is_empty() && self.name.is_empty()
    }
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Identifier of an entity in the remote repository.
///
/// A completely empty id names the virtual navigation root. An id with a
/// class but no remote identifier names an object that was created locally
/// and has not been assigned an identifier by the server yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteId {
    /// Class of the entity.
    pub class: ClassKey,
    /// Server-assigned identifier.
    pub remote_id: String,
}

impl RemoteId {
    /// Creates a new remote id.
    pub fn new(class: ClassKey, remote_id: impl Into<String>) -> Self {
        Self {
            class,
            remote_id: remote_id.into(),
        }
    }

    /// Creates a remote id from a `Schema.Class` string and an identifier.
    ///
    /// A string without a schema separator is used as the class name with an
    /// empty schema.
    pub fn parse(qualified_class: &str, remote_id: impl Into<String>) -> Self {
        let class = ClassKey::parse(qualified_class)
            .unwrap_or_else(|| ClassKey::new("", qualified_class));
        Self::new(class, remote_id)
    }

    /// The virtual navigation root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Returns true if this id names the virtual navigation root.
    pub fn is_root(&self) -> bool {
        self.class.is_empty() && self.remote_id.is_empty()
    }

    /// Returns true if the server has not assigned an identifier yet.
    pub fn is_pending(&self) -> bool {
        !self.class.is_empty() && self.remote_id.is_empty()
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}:{}", self.class, self.remote_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_key_parse() {
        let key = ClassKey::parse("TestSchema.TestClass").unwrap();
        assert_eq!(key.schema, "TestSchema");
        assert_eq!(key.name, "TestClass");
        assert_eq!(key.to_string(), "TestSchema.TestClass");

        assert!(ClassKey::parse("NoSchema").is_none());
    }

    #[test]
    fn root_and_pending() {
        assert!(RemoteId::root().is_root());
        assert!(!RemoteId::root().is_pending());

        let pending = RemoteId::parse("TestSchema.TestClass", "");
        assert!(pending.is_pending());
        assert!(!pending.is_root());

        let assigned = RemoteId::parse("TestSchema.TestClass", "A");
        assert!(!assigned.is_pending());
        assert_eq!(assigned.to_string(), "TestSchema.TestClass:A");
    }
}
