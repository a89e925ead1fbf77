//! This module contains the internals of how the concurrent radix tree
//! is implemented. You should turn back now. Nothing of value is here.
//! Everything in this module leans on the epoch collector and the writer
//! lock being used exactly as the public wrapper uses them - handled any
//! other way it will inflict horror upon you.

pub(crate) mod radix;
