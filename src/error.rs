//! Error Types
//!
//! This module defines the error types used throughout the runtime.
//!
//! # Overview
//!
//! The main error type [`WeftError`] covers all failure modes including:
//! - Backing-memory allocation failures
//! - Stale or malformed resource handles
//! - Pre-submission validation failures
//! - Backend and device-level errors
//!
//! # Recovery policy
//!
//! Each variant maps to a fixed recovery policy:
//!
//! | Variant | Policy |
//! |---------|--------|
//! | `OutOfMemory` | Retried once after a frame retire; surfaced on second failure, frame aborted |
//! | `InvalidHandle` | Programmer error — panics in debug, logged + pass skipped in release |
//! | `Validation` | Debug-only assert, logged in release |
//! | `Backend` | Surfaced to the caller; offending pass and dependents culled for the frame |
//! | `DeviceLost` | All in-flight state flushed; persistent resources re-materialized next frame |
//!
//! A frame either commits fully or is abandoned before submission; no variant
//! leaves partial state behind.

use thiserror::Error;

use crate::handle::ResourceHandle;

/// The main error type for the Weft runtime.
#[derive(Error, Debug)]
pub enum WeftError {
    // ========================================================================
    // Memory
    // ========================================================================
    /// Backing-memory materialization failed.
    ///
    /// `retried` is `true` when the allocation already went through the
    /// retry-after-retire path and failed a second time.
    #[error("out of GPU memory (retried: {retried})")]
    OutOfMemory {
        /// Whether the retry-after-retire path was already taken.
        retried: bool,
    },

    // ========================================================================
    // Handles & validation
    // ========================================================================
    /// A handle with a stale generation or out-of-range slot was used.
    #[error("invalid resource handle: {0:?}")]
    InvalidHandle(ResourceHandle),

    /// `replace_backing` was called with a descriptor that does not match
    /// the slot's original descriptor.
    #[error("descriptor mismatch on replace_backing: {0}")]
    DescriptorMismatch(String),

    /// A pre-submission validation rule was violated (e.g. a memoryless
    /// texture used across encoders).
    #[error("validation failure: {0}")]
    Validation(String),

    // ========================================================================
    // Backend & device
    // ========================================================================
    /// The backend rejected an operation (e.g. pipeline creation failed).
    #[error("backend error: {0}")]
    Backend(String),

    /// A fence wait timed out at submission.
    #[error("device lost (fence wait timed out)")]
    DeviceLost,
}

/// Convenience alias used by all public APIs in this crate.
pub type Result<T> = std::result::Result<T, WeftError>;
