//! Conradix - A Concurrently Readable Radix Tree
//!
//! Concurrently readable is often referred to as [Copy-On-Write](https://en.wikipedia.org/wiki/Copy-on-write)
//! or [Multi-Version-Concurrency-Control](https://en.wikipedia.org/wiki/Multiversion_concurrency_control).
//!
//! This library provides an ordered map over byte string keys backed by a
//! path-compressed radix tree. Lookups proceed without taking any lock
//! and without blocking on writers; writers are serialised, just like a
//! mutex, and never block readers.
//!
//! You can use this in place of `RwLock<BTreeMap<Vec<u8>, V>>` where the
//! workload is read dominated, and will likely see improvements in
//! parallel throughput of your application.
//!
//! Unlike a reader-writer lock, a reader here never waits: each lookup
//! walks the live tree under an epoch pin and observes a consistent
//! snapshot of every edge it follows. A lookup racing an insert of the
//! same key may see the state before or after that insert - whichever
//! single publication store it observes - but never a torn or partially
//! built node.
//!
//! The tree orders keys lexicographically by their bytes. Fixed-width
//! integer keys can keep their numeric order through the encodings in
//! [`keycode`].
//!
//! # Features
//!
//! * `serde` - serialization support for [`RadixMap`]

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

// This is where the scary rust lives.
mod internals;

// This is where the good rust lives.
pub mod radix;

pub mod keycode;

#[allow(unused)]
mod utils;

pub use radix::RadixMap;
