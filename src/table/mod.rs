//! Table identity, metadata, registry and storage

pub mod meta;
pub mod reader;
pub mod registry;
pub mod token;
pub mod writer;

pub use meta::{ColumnMeta, ColumnType, TableMeta, TxnFile};
pub use reader::TableReader;
pub use registry::{NameEntry, TableNameRegistry};
pub use token::TableToken;
pub use writer::{Row, TableWriter, Value};

/// Table metadata file.
pub const META_FILE_NAME: &str = "_meta";
/// Transaction counter file.
pub const TXN_FILE_NAME: &str = "_txn";
/// Column-version index file.
pub const CV_FILE_NAME: &str = "_cv";
/// Logical-name marker inside a table directory (non-WAL rename rewrites it).
pub const NAME_FILE_NAME: &str = "_name";
/// Name registry file under the database root.
pub const TABLES_D_FILE_NAME: &str = "tables.d";
/// Sequencer metadata directory (WAL tables only).
pub const SEQ_DIR_NAME: &str = "seq";
