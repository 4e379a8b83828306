// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Useful test utilities for mqproxy crates. Import them with:
//!
//! ```rust
//! use mqproxy_test_util::{assert, assert_eq, assert_ne};
//! ```
//!
//! Note: You cannot import them with a glob import, as the compiler won't be able to distinguish our imports and the stdlib imports.

use std::time::Duration;

/// Asserts that a future is not ready yet, without consuming it.
///
/// The future must be `Unpin`. Pass it by mutable reference to keep using it afterwards.
#[macro_export]
macro_rules! assert_pending {
    ($fut:expr) => {
        ::core::assert!(
            $crate::__private::FutureExt::now_or_never(&mut $fut).is_none(),
            "future should still be pending"
        );
    };
}

#[doc(hidden)]
pub mod __private {
    pub use futures::FutureExt;
}

// A couple of useful re-exports
pub use assert2::{assert, check, let_assert};
pub use pretty_assertions::{assert_eq, assert_ne};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Re-evaluates `condition` until it holds or `within` elapsed. Returns whether it held.
///
/// Useful to wait for effects of work running on other tasks, e.g. `assert!(eventually(..).await)`.
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
