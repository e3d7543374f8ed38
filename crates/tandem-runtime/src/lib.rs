//! Host runtime for tandem
//!
//! Provides the reference-counted side of the bridge:
//! - `HostValue`, the wrapper object model (one payload plus an optional engine tag)
//! - UTF-16 host strings and the explicit UCS-4 conversion
//! - Host dates and the seven-field engine decomposition
//! - The main-loop scheduler and its thread-safe post primitive
//!
//! Nothing in this crate knows about the script engine. The engine bridge in
//! `tandem-jsruntime` only observes reference counts and posts tasks.

pub mod date;
pub mod error;
pub mod scheduler;
pub mod string;
pub mod value;

pub use date::EngineDateFields;
pub use error::{HostError, HostResult};
pub use scheduler::{Scheduler, SchedulerHandle, Task};
pub use string::{as_ucs4, HostString};
pub use value::{ForeignObject, HostFn, HostValue, Payload, SendValue, TypeTag, WeakHostValue};
