// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Long polling for pop requests of the message queue proxy.
//!
//! A pop request that finds no message can be suspended with
//! [`SuspendRequestService::suspend`] instead of being answered empty. The request then waits
//! until either
//!
//! * [`SuspendRequestService::notify_arrival`] reports a message whose tag passes the request's
//!   [`MessageFilter`], and re-running the request's [`Supplier`] yields a result with something
//!   to deliver, or
//! * its poll timeout elapses and the expiration sweeper (or an explicit call to
//!   [`SuspendRequestService::clean_expired_requests`]) answers it with `None`.
//!
//! Exactly one of the two paths resolves a given request: both have to remove the request from
//! the [`SuspensionRegistry`] first, and only one of them can.

mod error;
mod filter;
mod metric_definitions;
mod options;
mod registry;
mod request;
mod service;
mod sweeper;

pub use error::{BuildError, SuspendError};
pub use filter::{Filter, MessageFilter};
pub use metric_definitions::{
    LONG_POLLING_REARMED_REQUESTS, LONG_POLLING_RESOLVED_REQUESTS, LONG_POLLING_SUPPLIER_FAILURES,
    LONG_POLLING_SUSPEND_REQUESTS, LONG_POLLING_SUSPENDED_REQUESTS,
};
pub use options::{Options, OptionsBuilder, OptionsBuilderError};
pub use registry::{Claim, ClaimId, QueueKey, SuspensionRegistry};
pub use request::{PollResult, RequestContext, SuspendedPoll, SuspendedRequest, Supplier};
pub use service::SuspendRequestService;
