// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;

#[derive(Debug, thiserror::Error)]
pub enum SuspendError {
    #[error("long polling service is shutting down")]
    ShuttingDown,
    #[error("too many suspended requests, limit is {limit}")]
    TooManySuspendedRequests { limit: NonZeroUsize },
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("long polling service must be created within a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
