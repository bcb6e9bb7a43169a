//! Materialized-view dependency graph
//!
//! Maps base tables to their dependent views and tracks per-view refresh
//! state. Views reference base tables by token value, never by handle, so a
//! base-table drop needs no traversal to detach. When materialized views are
//! disabled a no-op form is installed and every operation degrades to
//! nothing.

use crate::table::token::TableToken;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatViewDefinition {
    pub view_sql: String,
    pub base_table_dir: String,
}

#[derive(Debug, Default)]
pub struct MatViewState {
    invalid: AtomicBool,
    invalidation_reason: Mutex<Option<String>>,
    last_refresh_base_txn: AtomicI64,
    last_refresh_timestamp: AtomicI64,
}

impl MatViewState {
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn invalidation_reason(&self) -> Option<String> {
        self.invalidation_reason.lock().clone()
    }

    pub fn last_refresh_base_txn(&self) -> i64 {
        self.last_refresh_base_txn.load(Ordering::Acquire)
    }

    pub fn last_refresh_timestamp(&self) -> i64 {
        self.last_refresh_timestamp.load(Ordering::Acquire)
    }

    pub fn refreshed(&self, base_txn: i64, timestamp: i64) {
        self.last_refresh_base_txn.store(base_txn, Ordering::Release);
        self.last_refresh_timestamp.store(timestamp, Ordering::Release);
    }
}

struct ViewEntry {
    token: TableToken,
    definition: MatViewDefinition,
    state: Arc<MatViewState>,
}

/// Refresh work produced by base-table commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTask {
    pub view: TableToken,
    pub base: TableToken,
    pub base_seq_txn: i64,
}

pub struct MatViewGraph {
    enabled: bool,
    /// view dir -> entry
    views: DashMap<String, ViewEntry, ahash::RandomState>,
    /// base dir -> dependent view tokens
    dependents: DashMap<String, Vec<TableToken>, ahash::RandomState>,
    refresh_queue: Mutex<VecDeque<RefreshTask>>,
}

impl MatViewGraph {
    pub fn new() -> Self {
        Self::with_enabled(true)
    }

    /// The no-op form: installed when materialized views are disabled.
    pub fn disabled() -> Self {
        Self::with_enabled(false)
    }

    fn with_enabled(enabled: bool) -> Self {
        Self {
            enabled,
            views: DashMap::with_hasher(ahash::RandomState::new()),
            dependents: DashMap::with_hasher(ahash::RandomState::new()),
            refresh_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add_view(
        &self,
        view: &TableToken,
        base: &TableToken,
        definition: MatViewDefinition,
    ) -> Arc<MatViewState> {
        let state = Arc::new(MatViewState::default());
        if !self.enabled {
            return state;
        }
        self.views.insert(
            view.dir_name().to_string(),
            ViewEntry {
                token: view.clone(),
                definition,
                state: state.clone(),
            },
        );
        self.dependents
            .entry(base.dir_name().to_string())
            .or_default()
            .push(view.clone());
        state
    }

    pub fn drop_view_if_exists(&self, view: &TableToken) -> bool {
        if !self.enabled {
            return false;
        }
        let Some((_, entry)) = self.views.remove(view.dir_name()) else {
            return false;
        };
        if let Some(mut deps) = self.dependents.get_mut(&entry.definition.base_table_dir) {
            deps.retain(|t| t.dir_name() != view.dir_name());
        }
        true
    }

    /// Detach every view of a dropped base table; the views themselves stay
    /// (invalidated) so their owners can decide what to do.
    pub fn drop_base_table(&self, base: &TableToken) {
        if !self.enabled {
            return;
        }
        if let Some((_, views)) = self.dependents.remove(base.dir_name()) {
            for view in views {
                self.invalidate(&view, format!("base table dropped [table={}]", base));
            }
        }
    }

    pub fn dependent_views(&self, base: &TableToken) -> Vec<TableToken> {
        if !self.enabled {
            return Vec::new();
        }
        self.dependents
            .get(base.dir_name())
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn view_state(&self, view: &TableToken) -> Option<Arc<MatViewState>> {
        self.views.get(view.dir_name()).map(|e| e.state.clone())
    }

    pub fn view_definition(&self, view: &TableToken) -> Option<MatViewDefinition> {
        self.views.get(view.dir_name()).map(|e| e.definition.clone())
    }

    /// Fan a base-table commit out to refresh tasks, skipping invalid views.
    pub fn notify_txn_applied(&self, base: &TableToken, seq_txn: i64) {
        if !self.enabled {
            return;
        }
        let Some(deps) = self.dependents.get(base.dir_name()) else {
            return;
        };
        let mut queue = self.refresh_queue.lock();
        for view in deps.iter() {
            let skip = self
                .views
                .get(view.dir_name())
                .map(|e| e.state.is_invalid())
                .unwrap_or(true);
            if skip {
                continue;
            }
            queue.push_back(RefreshTask {
                view: view.clone(),
                base: base.clone(),
                base_seq_txn: seq_txn,
            });
        }
    }

    pub fn next_refresh_task(&self) -> Option<RefreshTask> {
        self.refresh_queue.lock().pop_front()
    }

    pub fn invalidate(&self, view: &TableToken, reason: String) {
        if let Some(entry) = self.views.get(view.dir_name()) {
            entry.state.invalid.store(true, Ordering::Release);
            *entry.state.invalidation_reason.lock() = Some(reason);
        }
    }

    pub fn revalidate(&self, view: &TableToken) {
        if let Some(entry) = self.views.get(view.dir_name()) {
            entry.state.invalid.store(false, Ordering::Release);
            *entry.state.invalidation_reason.lock() = None;
        }
    }

    /// Tokens of all registered views, for engine-wide sweeps.
    pub fn all_views(&self) -> Vec<TableToken> {
        self.views.iter().map(|e| e.token.clone()).collect()
    }
}

impl Default for MatViewGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(name: &str, mat_view: bool) -> TableToken {
        TableToken::new(name, format!("{name}~1"), 1, true, mat_view)
    }

    fn definition(base: &TableToken) -> MatViewDefinition {
        MatViewDefinition {
            view_sql: "select sym, avg(price) from base sample by 1h".into(),
            base_table_dir: base.dir_name().to_string(),
        }
    }

    #[test]
    fn test_notify_enqueues_refresh_for_valid_views() {
        let graph = MatViewGraph::new();
        let base = token("base", false);
        let v1 = token("v1", true);
        let v2 = token("v2", true);
        graph.add_view(&v1, &base, definition(&base));
        graph.add_view(&v2, &base, definition(&base));
        graph.invalidate(&v2, "manual".into());

        graph.notify_txn_applied(&base, 7);

        let task = graph.next_refresh_task().unwrap();
        assert_eq!(task.view.table_name(), "v1");
        assert_eq!(task.base_seq_txn, 7);
        // v2 is invalid: skipped.
        assert!(graph.next_refresh_task().is_none());
    }

    #[test]
    fn test_drop_base_invalidates_dependents() {
        let graph = MatViewGraph::new();
        let base = token("base", false);
        let view = token("v", true);
        let state = graph.add_view(&view, &base, definition(&base));

        graph.drop_base_table(&base);
        assert!(state.is_invalid());
        assert!(state.invalidation_reason().unwrap().contains("base table dropped"));
        assert!(graph.dependent_views(&base).is_empty());
    }

    #[test]
    fn test_drop_view_detaches_from_base() {
        let graph = MatViewGraph::new();
        let base = token("base", false);
        let view = token("v", true);
        graph.add_view(&view, &base, definition(&base));

        assert!(graph.drop_view_if_exists(&view));
        assert!(!graph.drop_view_if_exists(&view));
        graph.notify_txn_applied(&base, 1);
        assert!(graph.next_refresh_task().is_none());
    }

    #[test]
    fn test_disabled_graph_is_noop() {
        let graph = MatViewGraph::disabled();
        let base = token("base", false);
        let view = token("v", true);
        graph.add_view(&view, &base, definition(&base));

        graph.notify_txn_applied(&base, 1);
        assert!(graph.next_refresh_task().is_none());
        assert!(graph.dependent_views(&base).is_empty());
        assert!(!graph.drop_view_if_exists(&view));
    }
}
