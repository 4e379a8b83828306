// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytestring::ByteString;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::filter::MessageFilter;
use crate::registry::QueueKey;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Caller context of a suspended request. The engine never interprets it, it only ends up in
/// log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: u64,
    client_id: Option<ByteString>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<ByteString>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a single fetch attempt.
pub trait PollResult: Send + 'static {
    /// Whether this result carries something to deliver to the client. A result returning
    /// `false` means the attempt found nothing and the request may keep waiting.
    fn needs_response(&self) -> bool;
}

/// Re-attempts the read of a suspended request.
///
/// The argument is the poll time the request has left at the moment of the attempt. A failed
/// future counts as "nothing found this time".
pub trait Supplier<R>: Send + Sync + 'static {
    fn supply(&self, remaining: Duration) -> BoxFuture<'static, anyhow::Result<R>>;
}

impl<R, F, Fut> Supplier<R> for F
where
    R: 'static,
    F: Fn(Duration) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    fn supply(&self, remaining: Duration) -> BoxFuture<'static, anyhow::Result<R>> {
        (self)(remaining).boxed()
    }
}

/// A parked long-poll request.
///
/// Whoever owns a `SuspendedRequest` owns the right to resolve it. The registry hands out
/// ownership only through its drain operations and [`SuspendedRequest::complete`] consumes the
/// request, so the caller's future cannot be completed twice. Dropping a request without
/// completing it resolves the caller's future as absent.
pub struct SuspendedRequest<R> {
    context: RequestContext,
    key: QueueKey,
    filter: Arc<dyn MessageFilter>,
    deadline: Instant,
    supplier: Arc<dyn Supplier<R>>,
    completion: oneshot::Sender<Option<R>>,
}

impl<R: PollResult> SuspendedRequest<R> {
    pub(crate) fn new(
        context: RequestContext,
        key: QueueKey,
        filter: Arc<dyn MessageFilter>,
        deadline: Instant,
        supplier: Arc<dyn Supplier<R>>,
    ) -> (Self, SuspendedPoll<R>) {
        let (completion, rx) = oneshot::channel();
        (
            Self {
                context,
                key,
                filter,
                deadline,
                supplier,
                completion,
            },
            SuspendedPoll { rx },
        )
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    /// Zero once the deadline has passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.filter.matches(tag)
    }

    pub(crate) fn filter(&self) -> &Arc<dyn MessageFilter> {
        &self.filter
    }

    /// Whether the caller is still waiting for this request.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    pub(crate) fn supply(&self, remaining: Duration) -> BoxFuture<'static, anyhow::Result<R>> {
        self.supplier.supply(remaining)
    }

    /// Resolves the caller's future. Returns `false` if the caller stopped waiting.
    pub(crate) fn complete(self, result: Option<R>) -> bool {
        self.completion.send(result).is_ok()
    }
}

impl<R> fmt::Debug for SuspendedRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedRequest")
            .field("context", &self.context)
            .field("key", &self.key)
            .field("filter", &self.filter)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Future handed to the caller of [`crate::SuspendRequestService::suspend`].
///
/// Resolves to `Some` with the supplier's result once a notification produced something to
/// deliver, or `None` when the request expired, was not suspended at all, or the service went
/// away.
#[must_use = "futures do nothing unless polled"]
pub struct SuspendedPoll<R> {
    rx: oneshot::Receiver<Option<R>>,
}

impl<R> SuspendedPoll<R> {
    pub(crate) fn ready(result: Option<R>) -> Self {
        let (tx, rx) = oneshot::channel();
        // rx is alive, send cannot fail
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<R> Future for SuspendedPoll<R> {
    type Output = Option<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.ok().flatten())
    }
}

impl<R> fmt::Debug for SuspendedPoll<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedPoll").finish_non_exhaustive()
    }
}
