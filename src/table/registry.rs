//! Table name registry
//!
//! Authoritative name-to-token mapping guarded by a single writer lock. An
//! entry is in exactly one state: absent (free), `Locked` (create in
//! flight), `Live`, or `LockedDrop` (drop in flight). Concurrent lookups see
//! a definite "reserved" or "gone" answer instead of a race.
//!
//! Persistence is a text file `tables.d` under the database root, written
//! append-then-compact: every register/drop/rename appends a line and is
//! fsynced; `reconcile` rewrites the file from the live map. On reload,
//! when two names claim the same directory (a WAL rename that crashed
//! mid-way), the name appended last wins.

use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use crate::table::token::TableToken;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameEntry {
    /// Reserved by an in-flight create.
    Locked(TableToken),
    Live(TableToken),
    /// Dropped, awaiting directory cleanup.
    LockedDrop(TableToken),
}

impl NameEntry {
    fn token(&self) -> &TableToken {
        match self {
            NameEntry::Locked(t) | NameEntry::Live(t) | NameEntry::LockedDrop(t) => t,
        }
    }
}

pub struct TableNameRegistry {
    ff: FilesFacade,
    file_path: PathBuf,
    map: RwLock<AHashMap<String, NameEntry>>,
}

impl TableNameRegistry {
    pub fn open(ff: FilesFacade, db_root: &std::path::Path) -> Result<Self> {
        let registry = Self {
            ff,
            file_path: db_root.join(super::TABLES_D_FILE_NAME),
            map: RwLock::new(AHashMap::new()),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Reserve `name` for an in-flight create. Returns a fresh token, or
    /// `None` when the name is taken in any state.
    pub fn lock_table_name(
        &self,
        name: &str,
        dir_name: &str,
        table_id: i32,
        is_wal: bool,
        is_mat_view: bool,
    ) -> Option<TableToken> {
        let mut map = self.map.write();
        if map.contains_key(name) {
            return None;
        }
        let token = TableToken::new(name, dir_name, table_id, is_wal, is_mat_view);
        map.insert(name.to_string(), NameEntry::Locked(token.clone()));
        Some(token)
    }

    /// Promote a reservation to live and persist it.
    pub fn register_name(&self, token: &TableToken) -> Result<()> {
        let mut map = self.map.write();
        match map.get(token.table_name()) {
            Some(NameEntry::Locked(locked)) if locked == token => {}
            other => {
                return Err(EngineError::critical(format!(
                    "cannot register name, entry not locked by this create [table={},entry={other:?}]",
                    token.table_name()
                )))
            }
        }
        map.insert(
            token.table_name().to_string(),
            NameEntry::Live(token.clone()),
        );
        self.append_line(&add_line(token))
    }

    /// Roll back a failed create. A no-op unless the entry is still this
    /// create's reservation.
    pub fn unlock_table_name(&self, token: &TableToken) {
        let mut map = self.map.write();
        if matches!(map.get(token.table_name()), Some(NameEntry::Locked(t)) if t == token) {
            map.remove(token.table_name());
        }
    }

    /// Install `new_name` as a second live name for the same directory.
    /// Used by WAL rename: the old name stays alive so a crash mid-rename
    /// leaves at least one resolvable name.
    pub fn add_table_alias(&self, new_name: &str, token: &TableToken) -> Result<TableToken> {
        let mut map = self.map.write();
        if map.contains_key(new_name) {
            return Err(EngineError::TableExists(new_name.to_string()));
        }
        let alias = token.renamed(new_name);
        map.insert(new_name.to_string(), NameEntry::Live(alias.clone()));
        self.append_line(&add_line(&alias))?;
        Ok(alias)
    }

    /// Remove one live name (the old half of a WAL rename).
    pub fn remove_name(&self, token: &TableToken) -> Result<()> {
        let mut map = self.map.write();
        match map.get(token.table_name()) {
            Some(NameEntry::Live(live)) if live.dir_name() == token.dir_name() => {
                map.remove(token.table_name());
                self.append_line(&format!("drop {}\n", token.table_name()))
            }
            _ => Err(EngineError::TableDoesNotExist(
                token.table_name().to_string(),
            )),
        }
    }

    /// Atomically swing a name while keeping the directory (non-WAL rename
    /// swaps the directory too; the token carries whatever the caller built).
    pub fn rename(&self, old_token: &TableToken, new_token: &TableToken) -> Result<()> {
        let mut map = self.map.write();
        match map.get(old_token.table_name()) {
            Some(NameEntry::Live(live)) if live == old_token => {}
            _ => {
                return Err(EngineError::TableDoesNotExist(
                    old_token.table_name().to_string(),
                ))
            }
        }
        if map.contains_key(new_token.table_name()) {
            return Err(EngineError::TableExists(new_token.table_name().to_string()));
        }
        map.remove(old_token.table_name());
        map.insert(
            new_token.table_name().to_string(),
            NameEntry::Live(new_token.clone()),
        );
        self.append_line(&format!(
            "drop {}\n{}",
            old_token.table_name(),
            add_line(new_token)
        ))
    }

    /// `Live -> LockedDrop`. True when this caller took ownership of the
    /// drop.
    pub fn drop_table(&self, token: &TableToken) -> Result<bool> {
        let mut map = self.map.write();
        match map.get(token.table_name()) {
            Some(NameEntry::Live(live)) if live == token => {}
            _ => return Ok(false),
        }
        map.insert(
            token.table_name().to_string(),
            NameEntry::LockedDrop(token.clone()),
        );
        self.append_line(&format!("drop {}\n", token.table_name()))?;
        Ok(true)
    }

    /// Forget a dropped table once its directory is gone.
    pub fn purge(&self, token: &TableToken) {
        let mut map = self.map.write();
        if matches!(map.get(token.table_name()), Some(NameEntry::LockedDrop(t)) if t == token) {
            map.remove(token.table_name());
        }
    }

    pub fn get_token_if_exists(&self, name: &str) -> Option<TableToken> {
        match self.map.read().get(name) {
            Some(NameEntry::Live(token)) => Some(token.clone()),
            _ => None,
        }
    }

    /// Current state of a name, transient states included.
    pub fn entry(&self, name: &str) -> Option<NameEntry> {
        self.map.read().get(name).cloned()
    }

    /// True when `token` is still the live owner of its name.
    pub fn is_current(&self, token: &TableToken) -> bool {
        matches!(
            self.map.read().get(token.table_name()),
            Some(NameEntry::Live(live)) if live == token
        )
    }

    /// Tables dropped but not yet purged from disk.
    pub fn dropped_tokens(&self) -> Vec<TableToken> {
        self.map
            .read()
            .values()
            .filter_map(|e| match e {
                NameEntry::LockedDrop(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live_tokens(&self) -> Vec<TableToken> {
        self.map
            .read()
            .values()
            .filter_map(|e| match e {
                NameEntry::Live(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Rebuild the map from `tables.d`. Later lines win, both for a name
    /// and for a directory claimed by two names.
    pub fn reload(&self) -> Result<()> {
        let mut map: AHashMap<String, NameEntry> = AHashMap::new();
        let mut dir_owner: AHashMap<String, String> = AHashMap::new();
        if self.ff.exists(&self.file_path) {
            let bytes = self.ff.read(&self.file_path)?;
            let text = String::from_utf8(bytes).map_err(|e| EngineError::Corrupt {
                path: self.file_path.clone(),
                detail: format!("registry file not utf-8: {e}"),
            })?;
            for line in text.lines() {
                let fields: Vec<&str> = line.split_whitespace().collect();
                match fields.as_slice() {
                    ["add", name, dir, id, wal, mv] => {
                        let token = TableToken::new(
                            *name,
                            *dir,
                            id.parse::<i32>().map_err(|_| self.bad_line(line))?,
                            *wal == "1",
                            *mv == "1",
                        );
                        // A directory claimed by an earlier name: the rename
                        // progressed past the alias append, newest name wins.
                        if let Some(previous) = dir_owner.insert(dir.to_string(), name.to_string())
                        {
                            if previous != *name {
                                map.remove(&previous);
                            }
                        }
                        map.insert(name.to_string(), NameEntry::Live(token));
                    }
                    ["drop", name] => {
                        if let Some(entry) = map.remove(*name) {
                            dir_owner.remove(entry.token().dir_name());
                        }
                    }
                    [] => {}
                    _ => return Err(self.bad_line(line)),
                }
            }
        }
        *self.map.write() = map;
        Ok(())
    }

    /// Compact `tables.d` down to the live entries. Runs under the exclusive
    /// map lock so no append can interleave.
    pub fn reconcile(&self) -> Result<()> {
        let map = self.map.write();
        let mut contents = String::new();
        for entry in map.values() {
            if let NameEntry::Live(token) = entry {
                contents.push_str(&add_line(token));
            }
        }
        self.ff.write_atomic(&self.file_path, contents.as_bytes())
    }

    fn bad_line(&self, line: &str) -> EngineError {
        EngineError::Corrupt {
            path: self.file_path.clone(),
            detail: format!("unparseable registry line: {line:?}"),
        }
    }

    /// Append under the exclusive map lock held by the caller; line order in
    /// the file mirrors operation order.
    fn append_line(&self, line: &str) -> Result<()> {
        let mut file = self.ff.open_rw(&self.file_path)?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::io("stat tables.d", e))?
            .len();
        self.ff.write_at(&mut file, len, line.as_bytes())?;
        self.ff.fdatasync(&file)
    }
}

fn add_line(token: &TableToken) -> String {
    format!(
        "add {} {} {} {} {}\n",
        token.table_name(),
        token.dir_name(),
        token.table_id(),
        u8::from(token.is_wal()),
        u8::from(token.is_mat_view()),
    )
}

/// Validate a table name: non-empty, bounded, and made of characters that
/// are safe in every filesystem the engine runs on.
pub fn verify_table_name(name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() || name.len() > max_len {
        return Err(EngineError::InvalidTableName(name.to_string()));
    }
    if name.starts_with('.') {
        return Err(EngineError::InvalidTableName(name.to_string()));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if !ok {
        return Err(EngineError::InvalidTableName(name.to_string()));
    }
    Ok(())
}
