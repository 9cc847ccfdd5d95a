//! # Kernel synchronization primitives
//!
//! The memory core runs on a single CPU; its only synchronization primitive
//! is masking hardware interrupts around short critical sections. This crate
//! provides that discipline as RAII types:
//!
//! - [`IrqGuard`] — save-and-disable interrupts, restore on drop.
//! - [`SpinLock`] — an interior-mutability cell; [`SpinLock::lock_irq`]
//!   combines it with an [`IrqGuard`] so a critical section cannot leak a
//!   disabled-interrupt state on early return.
//! - [`SyncOnceCell`] — one-shot initialization for kernel-wide tables.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinGuard, SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
