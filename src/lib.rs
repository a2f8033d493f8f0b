//! pgatomic - atomic blocks with isolation levels and retries
//!
//! Runs units of work in database transactions at an explicit isolation level
//! and re-runs them when PostgreSQL reports a serialization failure or a
//! deadlock. Blocks nest: the outermost one owns the transaction, inner ones
//! become savepoints and inherit its isolation level.
//!
//! # Example
//!
//! ```no_run
//! use pgatomic::memory::MemoryDatabase;
//! use pgatomic::{atomic, Connections, Error, SERIALIZABLE};
//! use serde_json::json;
//!
//! let db = MemoryDatabase::new();
//! let mut connections = Connections::with_default(db.connect());
//!
//! atomic()
//!     .isolation_level(SERIALIZABLE)
//!     .retry(3)
//!     .run(&mut connections, |conns| {
//!         let conn = conns.default_connection()?;
//!         conn.insert("trades", "t1", json!({"price": 1}))?;
//!         Ok::<_, Error>(())
//!     })
//!     .unwrap();
//! ```

pub mod atomic;
pub mod config;
pub mod connection;
pub mod error;
pub mod isolation;
pub mod memory;

pub use atomic::{atomic, Atomic, AtomicBlock, AtomicFn};
pub use config::{RetryPolicy, Settings, SettingsError};
pub use connection::{Connection, Connections, Exit, Session, DEFAULT_DB_ALIAS};
pub use error::{DatabaseCause, DatabaseError, Error, Result, SqlState};
pub use isolation::{IsolationLevel, READ_COMMITTED, REPEATABLE_READ, SERIALIZABLE};
