#![forbid(unsafe_code)]

pub mod config;
pub mod download;
pub mod error;
pub mod formats;
pub mod jobs;
pub mod metadata;
pub mod progress;
pub mod security;
pub mod tools;

#[cfg(test)]
mod testing;
