//! In-memory transactional object store for services and tasks.
//!
//! ## Architecture
//! ```text
//!   update(|tx| ...) ──► staged overlay ──► commit (index += 1)
//!                                             │
//!                                             ├─► apply records (meta.version = index)
//!                                             └─► publish: Event per record, then Commit
//!                                                      │
//!                                                      ▼
//!                                   broadcast ──► Watch (kind filter) ──► consumers
//! ```
//!
//! ## Rules
//! - Transactions are serialized; a committed transaction is visible to every later one.
//! - Updates carry the record version they were read at; a mismatch is a
//!   [`StoreError::SequenceConflict`] and the caller re-reads and retries.
//! - Events are published under the store lock, so every watcher sees commits in order.
//! - A transaction that changes nothing publishes nothing.

mod error;
pub use error::StoreError;

mod event;
pub use event::{Event, EventKind};

mod store;
pub use store::{MemoryStore, DEFAULT_WATCH_CAPACITY};

mod tx;
pub use tx::{ReadTx, Tx, View};

mod watch;
pub use watch::Watch;
