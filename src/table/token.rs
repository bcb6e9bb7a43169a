//! Table identity tokens

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Immutable identity of a table.
///
/// A token pins a filesystem directory whose name never changes across a
/// rename; only the logical `table_name` does. Tokens compare by value on
/// every field, so two tokens with the same `table_id` but different names
/// indicate a stale reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableToken {
    table_name: Arc<str>,
    dir_name: Arc<str>,
    table_id: i32,
    is_wal: bool,
    is_mat_view: bool,
}

impl TableToken {
    pub fn new(
        table_name: impl Into<Arc<str>>,
        dir_name: impl Into<Arc<str>>,
        table_id: i32,
        is_wal: bool,
        is_mat_view: bool,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            dir_name: dir_name.into(),
            table_id,
            is_wal,
            is_mat_view,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    pub fn is_wal(&self) -> bool {
        self.is_wal
    }

    pub fn is_mat_view(&self) -> bool {
        self.is_mat_view
    }

    /// Same table, new logical name. The directory never moves.
    pub fn renamed(&self, new_name: &str) -> Self {
        Self {
            table_name: Arc::from(new_name),
            dir_name: self.dir_name.clone(),
            table_id: self.table_id,
            is_wal: self.is_wal,
            is_mat_view: self.is_mat_view,
        }
    }
}

impl fmt::Display for TableToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.table_name, self.table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_compare_by_value() {
        let a = TableToken::new("trades", "trades", 1, true, false);
        let b = TableToken::new("trades", "trades", 1, true, false);
        assert_eq!(a, b);

        // Same id, different name: stale reference, not equal.
        let renamed = a.renamed("trades_v2");
        assert_ne!(a, renamed);
        assert_eq!(renamed.dir_name(), "trades");
        assert_eq!(renamed.table_id(), 1);
    }
}
