//! Event data structures and the trace line format

mod events;
mod format;

pub use events::*;
pub use format::*;
