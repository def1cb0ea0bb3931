//! Process event correlation for kernel security observability.
//!
//! Raw execve/exit notifications leave the kernel through independent
//! per-CPU buffers with no total order: an exit can be observed before
//! the execve that created the process, and both may reference facts
//! (parent identity, container and pod metadata, hostnames) that other
//! subsystems populate asynchronously. This crate turns that stream
//! into semantically complete, correctly ordered events:
//!
//! - [`process_table::ProcessTable`] keeps the logical process tree,
//!   keyed by kernel identity, with reference-counted lifetimes;
//! - [`correlation::CorrelationEngine`] validates raw messages,
//!   resolves them against the table and the [`lookup`] services, and
//!   defers whatever cannot be resolved yet;
//! - the engine's periodic sweep retries deferred events under a
//!   bounded budget and degrades to partial data instead of dropping;
//! - [`fanout::Fanout`] hands each finalized event to every registered
//!   listener exactly once, execs always before the matching exit.

pub mod config;
pub mod correlation;
pub mod event;
pub mod fanout;
pub mod lookup;
pub mod process_table;
pub mod shutdown;

pub use config::{ConfigError, CorrelationConfig, ModuleConfig};
pub use correlation::{CorrelationEngine, CorrelationStats};
pub use event::{ContainerMetadata, Event, Payload, Pod, ProcessSnapshot};
pub use fanout::{Fanout, ListenerId};
pub use shutdown::{CleanExit, ShutdownSender, ShutdownSignal};
