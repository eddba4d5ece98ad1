//! Remote queries.

use crate::ids::{ClassKey, RemoteId};
use serde::{Deserialize, Serialize};

/// A query against the remote repository.
///
/// Queries are value types: two queries are the same request iff they
/// compare equal, which lets fakes and caches key on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// Class to query. Empty for navigation queries spanning all classes.
    pub class: ClassKey,
    /// Parent whose navigation children are requested.
    pub parent: Option<RemoteId>,
    /// Restricts the result to these instances.
    pub ids: Vec<RemoteId>,
    /// Properties to return. `None` returns full instances.
    pub select: Option<Vec<String>>,
}

impl Query {
    /// Creates a query for all instances of a class.
    pub fn class(class: ClassKey) -> Self {
        Self {
            class,
            ..Self::default()
        }
    }

    /// Creates a query for the navigation children of `parent`.
    ///
    /// Passing [`RemoteId::root`] queries the top level of the tree.
    pub fn navigation(parent: RemoteId) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    /// Creates a query that returns exactly the given instances.
    pub fn by_ids(ids: Vec<RemoteId>) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    /// Restricts the returned properties.
    pub fn with_select(mut self, properties: Vec<String>) -> Self {
        self.select = Some(properties);
        self
    }

    /// Returns true if the query returns partial instances.
    pub fn is_partial(&self) -> bool {
        self.select.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_query() {
        let parent = RemoteId::parse("S.C", "P");
        let query = Query::navigation(parent.clone());
        assert_eq!(query.parent, Some(parent));
        assert!(!query.is_partial());

        let partial = query.with_select(vec!["Name".into()]);
        assert!(partial.is_partial());
    }
}
