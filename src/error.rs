// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur constructing or growing the index.
///
/// Only construction and memory exhaustion ever surface as `Err`; every
/// other failure mode described in the crate docs (not-found, transient
/// gate contention, invariant violations) is handled without involving
/// this type.
#[derive(Debug)]
pub enum Error {
    /// A configuration value was invalid (bad segment size, non-power-of-two
    /// extent granularity, page size mismatch, ...).
    InvalidConfig(String),

    /// The OS refused to back new pages (mmap/mremap failed, or the
    /// aligned heap allocator returned null).
    OutOfMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for Error {}

/// Index result.
pub type Result<T> = std::result::Result<T, Error>;
