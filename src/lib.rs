//! # Tessera - Embedded Object Database Engine
//!
//! Tessera is an embedded object database with a columnar storage engine,
//! single-writer/many-reader MVCC transactions, and a query engine that
//! operates directly on packed integer leaves.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tessera::{ColumnType, Database, DbOptions};
//!
//! let db = Database::open("objects.tsra", DbOptions::default())?;
//!
//! let mut tx = db.start_write()?;
//! let people = tx.add_table("people")?;
//! let age = tx.add_column(people, "age", ColumnType::Int)?;
//! let obj = tx.create_object(people)?;
//! tx.set_int(people, obj, age, 42)?;
//! tx.commit()?;
//!
//! let read = db.start_read(tessera::VersionId::latest())?;
//! let adults = read.query(people).greater_equal(age, 18).count(&read)?;
//! assert_eq!(adults, 1);
//! # Ok::<(), tessera::CoreError>(())
//! ```
//!
//! ## Architecture
//!
//! The engine is layered, leaves first:
//! - **Slab allocator**: turns the memory-mapped file into an arena of refs
//!   with deferred free-space reuse and a crash-safe top-ref swap.
//! - **Packed arrays**: variable bit-width integer leaves with bit-hack and
//!   SIMD scan kernels.
//! - **B+trees**: ordered sequences of packed leaves; every column is one.
//! - **Group / tables / columns**: the schema layer binding stable object
//!   and column keys to trees.
//! - **Transactions**: snapshot versions tracked in a shared ring buffer;
//!   one writer, many readers.
//! - **Encryption**: optional AES-256-CBC + HMAC-SHA-224 paging below the
//!   allocator; plaintext never reaches disk.

pub mod alloc;
pub mod array;
pub mod collections;
pub mod column;
pub mod compression;
pub mod encryption;
pub mod error;
pub mod group;
pub mod history;
pub mod keys;
pub mod query;
pub mod sidecar;
pub mod table;
pub mod tree;
pub mod txn;

pub use crate::column::ColumnType;
pub use crate::error::{CoreError, Result};
pub use crate::group::Group;
pub use crate::history::{Changeset, History};
pub use crate::keys::{ColKey, ObjKey, TableKey};
pub use crate::query::{Query, Results};
pub use crate::txn::{Database, DbOptions, DurabilityLevel, TransactStage, Transaction, VersionId};
