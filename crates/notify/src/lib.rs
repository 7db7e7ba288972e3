//! Tether notify – fan-out of shared watches to many subscribers
//!
//! One [`Multiplexer`] keeps a single upstream connection per
//! [`WatchTarget`](tether_core::WatchTarget) and hands each subscriber a
//! bounded queue of the events matching its filter. Reconnects are hidden
//! from subscribers: no version is delivered twice and nothing is lost.

#![forbid(unsafe_code)]

mod generation;
mod ledger;
mod multiplexer;

pub use ledger::supersedes;
pub use multiplexer::{HandlerStats, Multiplexer, Subscription, Unsubscribe};
