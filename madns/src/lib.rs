//! `madns`: a multi-server asynchronous DNS resolver.
//!
//! Queries A records over UDP against one of several upstream nameservers
//! drawn from a `resolv.conf`-style file, tracks outstanding queries in a
//! bounded slot pool keyed by transaction ID, and keeps a small TTL cache so
//! repeated lookups for the same name don't hit the network at all. Every
//! operation is non-blocking; [`Resolver::fileno`] hands back a descriptor for
//! the caller's own event loop to poll.
//!
//! ```no_run
//! use std::path::Path;
//! use madns::Resolver;
//!
//! let mut resolver = Resolver::<u64>::create(Path::new("/etc/resolv.conf"), 5, 20)
//!     .expect("no usable nameservers");
//!
//! let tid = resolver.request("example.com", 1).expect("table full");
//! println!("sent query {tid:#06x}");
//! ```

mod cache;
mod config;
mod diag;
mod queries;
mod resolver;
mod servers;
mod socket;
mod wire;

pub use diag::{DumpOpts, Event, LogSink, NullSink, Sink};
pub use resolver::{Lookup, Outcome, Resolver};
pub use wire::{Answer, MAX_LABEL_LEN, MAX_NAME_LEN};
