//! Small shared building blocks: fast hash collections, clock helpers, and supervised task spawning.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod collections;
pub mod task;
pub mod time;
