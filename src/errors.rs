// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Common error types used throughout the crate
//!
//! Fatal invariant violations (a zombie mapping still observed as active, a
//! hole tree whose aggregate is wrong, a shootdown acknowledged before it
//! was submitted) are logic errors and panic. Everything that originates in
//! user supply is surfaced as one of the codes below.

use crate::types::Status;

/// Result type for operations that can fail
pub type Result<T = ()> = core::result::Result<T, Error>;

/// Common error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Non-page-aligned address or length, or an undefined flag bit
    IllegalArgs = -1,
    /// Physical memory is exhausted
    NoMemory = -2,
    /// Handle does not name any descriptor
    NoDescriptor = -3,
    /// Handle names a descriptor of the wrong kind
    BadDescriptor = -4,
    /// Mapping request exceeds the slice it maps
    BufferTooSmall = -5,
    /// Fetch with backing disallowed hit a missing cache page
    NoBacking = -6,
    /// The pager owning a managed view disappeared
    PagerGone = -7,
    /// Fault could not be resolved
    Fault = -8,
    /// Operation on a retired or torn-down object
    BadState = -9,
    /// Operation is not defined for this view kind
    NotSupported = -10,
}

impl Error {
    /// Convert error to status code
    pub fn to_status(self) -> Status {
        self as Status
    }

    /// Convert status code to error
    pub fn from_status(status: Status) -> Self {
        match status {
            -1 => Error::IllegalArgs,
            -2 => Error::NoMemory,
            -3 => Error::NoDescriptor,
            -4 => Error::BadDescriptor,
            -5 => Error::BufferTooSmall,
            -6 => Error::NoBacking,
            -7 => Error::PagerGone,
            -8 => Error::Fault,
            -9 => Error::BadState,
            _ => Error::NotSupported,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        err.to_status()
    }
}
