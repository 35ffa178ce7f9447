#![forbid(unsafe_code)]

pub mod config;
pub mod pending;
pub mod reconcile;
pub mod service;
