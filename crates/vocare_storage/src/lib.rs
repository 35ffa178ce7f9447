#![forbid(unsafe_code)]

pub mod json_file;
pub mod memory;
pub mod repo;
pub mod roster_cache;
