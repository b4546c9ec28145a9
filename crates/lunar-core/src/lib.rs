//! Runtime-independent core types for the lunar Lua compiler.

pub mod string;
