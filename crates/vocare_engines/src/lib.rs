#![forbid(unsafe_code)]

pub mod identity;
pub mod phone;
pub mod token;
