//! Address-space and object-file utilities for the shadow-stack runtime.
//!
//! This crate answers two questions the trace engine keeps asking: "which objects are loaded
//! into this process, and where?" ([obj]) and "which function does this code address belong
//! to?" ([sym]).

pub mod obj;
pub mod sym;
