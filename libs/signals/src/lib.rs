//! Reactive Signals
//!
//! Observable values whose changes travel as structural patches:
//!
//! - [`Signal`]: synchronous container, the base primitive
//! - [`LazySignal`]: mirrors an upstream producer only while observed
//! - [`OwlSignal`]: optimistic writable mirror with a tagged write loop
//! - [`SlicedSignal`] / [`SlicedWritableSignal`]: a nested field of a parent
//!   presented as its own root value

pub mod error;
pub mod lazy;
pub mod owl;
pub mod produce;
pub mod signal;
pub mod sliced;

pub use error::SignalError;
pub use lazy::{LazySignal, Setter, UpstreamEvent};
pub use owl::{OwlOptions, OwlSignal, PendingWrite, WriteUpstream};
pub use produce::{produce, producer};
pub use signal::{
    SharedUpdater, Signal, Subscribable, Subscriber, Subscription, Updater, Writable,
};
pub use sliced::{translate_patches, SliceBuilder, SlicedSignal, SlicedWritableSignal};
