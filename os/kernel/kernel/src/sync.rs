//! # Blocking primitives
//!
//! A sleeping [`Mutex`] and a [`Condvar`], both built on the scheduler's
//! wait channels. Neither may be used from interrupt context; spinlocks are
//! the only lock an interrupt handler can take.

mod condvar;
mod mutex;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
