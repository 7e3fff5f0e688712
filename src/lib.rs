//! Userptr tracking and eviction core for a GPU driver.
//!
//! A driver registers device-visible mappings of a process's regular
//! virtual memory ([`BufferObject::register`]) and gets reliably told when
//! the CPU side remaps or frees those pages, via the address-space change
//! callbacks on [`AddressSpace`]. Graphics-class buffers are handled
//! synchronously inside the callback (wait for GPU idle, flag pages for
//! revalidation); compute-class buffers are handed to the owning
//! [`Process`]'s asynchronous evict/quiesce/restore machinery so the
//! callback never blocks on a queue drain.
//!
//! The GPU itself stays behind the [`GpuVm`], [`QueueController`] and
//! [`FenceSet`] traits; this crate owns the bookkeeping and the locking
//! discipline, not the hardware.

pub mod bo;
pub mod config;
pub mod error;
pub mod gpu;
pub mod interval;
pub mod mm;
pub mod notifier;
pub mod process;
pub mod work;

#[cfg(test)]
pub(crate) mod testing;

pub use bo::BufferObject;
pub use config::CoreConfig;
pub use error::{UserptrError, UserptrResult};
pub use gpu::{FenceSet, GpuDevice, GpuVm, MemoryObjectHandle, QueueController, WaitError};
pub use mm::{AddressSpace, MmObserver, SubscriptionId};
pub use notifier::{NotifierClass, NotifierContext};
pub use process::{BufferHandleEntry, Process, ProcessTable, SharedObject};
pub use work::{DelayedWork, WorkQueue};
