//! Lock-free containers for Rust, with `Hazard Pointers` based memory reclamation
//!
//! [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf) let a
//! thread publish the address of a shared node before dereferencing it, and clear it once it is
//! done. A node unlinked from a structure is retired instead of freed, and is only released when
//! a scan finds that no thread has it published, which also rules out the
//! [`ABA problem`](https://en.wikipedia.org/wiki/ABA_problem) for the pointer based containers.
//!
//! `HazardDomain` owns the per-thread hazard records and the retirement lists. `LockFreeStack`
//! and `LockFreeQueue` are linked structures that route their unlinked nodes through a domain.
//! `SpscRing` and `MpmcRing` are fixed-capacity ring buffers that never free a cell, so they need
//! no reclamation at all: the SPSC ring only orders plain loads and stores, the MPMC ring tags
//! every cell with a sequence number and only CASes the shared positions.
//!
//! None of the containers block. Full and empty are reported through return values.
//!
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod util;
mod hazard_pointer;
pub mod hazard_domain;
pub mod lockfree_stack;
pub mod lockfree_queue;
pub mod spsc_ring;
pub mod mpmc_ring;

pub use error::{Error, Result};
pub use hazard_domain::{HazardConfig, HazardDomain, SlotHandle};
pub use lockfree_queue::LockFreeQueue;
pub use lockfree_stack::LockFreeStack;
pub use mpmc_ring::MpmcRing;
pub use spsc_ring::{Consumer, Producer, SpscRing};

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;
