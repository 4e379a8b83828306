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
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytestring::ByteString;
use futures::FutureExt;
use metrics::counter;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{BuildError, SuspendError};
use crate::filter::MessageFilter;
use crate::metric_definitions::{
    self, LONG_POLLING_REARMED_REQUESTS, LONG_POLLING_RESOLVED_REQUESTS,
    LONG_POLLING_SUPPLIER_FAILURES, LONG_POLLING_SUSPEND_REQUESTS, OUTCOME_DELIVERED,
    OUTCOME_EXPIRED, OUTCOME_IMMEDIATE, OUTCOME_REJECTED, OUTCOME_SHUTDOWN, OUTCOME_SUSPENDED,
};
use crate::options::Options;
use crate::registry::{Claim, QueueKey, SuspensionRegistry};
use crate::request::{PollResult, RequestContext, SuspendedPoll, SuspendedRequest, Supplier};
use crate::sweeper::ExpirationSweeper;

/// Parks long-poll requests until a matching message arrives or their poll timeout elapses.
///
/// Handles are cheap to clone and share one registry.
pub struct SuspendRequestService<R> {
    inner: Arc<ServiceInner<R>>,
}

impl<R> Clone for SuspendRequestService<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServiceInner<R> {
    registry: SuspensionRegistry<R>,
    options: Options,
    runtime: Handle,
    shutdown: CancellationToken,
}

impl<R: PollResult> SuspendRequestService<R> {
    /// Creates a service without a running expiration sweeper. Expired requests are only
    /// cleaned up by calling [`Self::clean_expired_requests`] until [`Self::spawn_sweeper`] is
    /// called. See [`Options::build`] for the usual way to start the service.
    pub fn new(options: Options) -> Result<Self, BuildError> {
        let runtime = Handle::try_current()?;
        metric_definitions::describe_metrics();

        Ok(Self {
            inner: Arc::new(ServiceInner {
                registry: SuspensionRegistry::new(),
                options,
                runtime,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Suspends a pop request for up to `poll_timeout`.
    ///
    /// The returned future resolves with the supplier's result once a notification for the
    /// queue made the supplier find something to deliver, or with `None` once the poll timeout
    /// elapsed. Poll timeouts not above [`Options::min_poll_timeout`] are not suspended at all;
    /// the future is already resolved with `None` and the supplier is never invoked.
    ///
    /// The request expires `poll_timeout` from now, or [`Options::max_poll_timeout`] from now if
    /// that is configured and shorter.
    pub fn suspend(
        &self,
        context: RequestContext,
        topic: impl Into<ByteString>,
        queue_id: i32,
        filter: impl MessageFilter,
        poll_timeout: Duration,
        supplier: impl Supplier<R>,
    ) -> Result<SuspendedPoll<R>, SuspendError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            counter!(LONG_POLLING_SUSPEND_REQUESTS, "outcome" => OUTCOME_REJECTED).increment(1);
            return Err(SuspendError::ShuttingDown);
        }

        if poll_timeout <= inner.options.min_poll_timeout() {
            trace!(
                request_id = context.request_id(),
                ?poll_timeout,
                "Poll timeout too short, not suspending request"
            );
            counter!(LONG_POLLING_SUSPEND_REQUESTS, "outcome" => OUTCOME_IMMEDIATE).increment(1);
            return Ok(SuspendedPoll::ready(None));
        }

        if let Some(limit) = inner.options.max_suspended_requests() {
            if inner.registry.len() >= limit.get() {
                debug!(
                    request_id = context.request_id(),
                    %limit,
                    "Rejecting request, too many suspended requests"
                );
                counter!(LONG_POLLING_SUSPEND_REQUESTS, "outcome" => OUTCOME_REJECTED)
                    .increment(1);
                return Err(SuspendError::TooManySuspendedRequests { limit });
            }
        }

        let poll_timeout = match inner.options.max_poll_timeout() {
            Some(max_poll_timeout) => poll_timeout.min(max_poll_timeout),
            None => poll_timeout,
        };
        let key = QueueKey::new(topic, queue_id);
        trace!(
            request_id = context.request_id(),
            client_id = context.client_id(),
            %key,
            ?filter,
            ?poll_timeout,
            "Suspending request"
        );

        let (request, poll) = SuspendedRequest::new(
            context,
            key,
            Arc::new(filter),
            deadline_after(poll_timeout),
            Arc::new(supplier),
        );
        inner.registry.insert(request);
        counter!(LONG_POLLING_SUSPEND_REQUESTS, "outcome" => OUTCOME_SUSPENDED).increment(1);

        // shutdown may have drained the registry between the check above and the insert
        if inner.shutdown.is_cancelled() {
            inner.resolve_all_on_shutdown();
        }

        Ok(poll)
    }

    /// Signals that a message tagged `tag` became visible on the given queue.
    ///
    /// Returns immediately. Matching requests are claimed and retried on the runtime, each
    /// independently of the others.
    pub fn notify_arrival(
        &self,
        topic: impl Into<ByteString>,
        queue_id: i32,
        tag: impl Into<ByteString>,
    ) {
        let key = QueueKey::new(topic, queue_id);
        let tag = tag.into();
        let inner = Arc::clone(&self.inner);

        self.inner.runtime.spawn(async move {
            ServiceInner::on_arrival(&inner, &key, &tag);
        });
    }

    /// Resolves every request whose poll timeout elapsed with `None`. Returns the number of
    /// expired requests.
    pub fn clean_expired_requests(&self) -> usize {
        let expired = self.inner.registry.drain_expired(Instant::now());
        let count = expired.len();

        for request in expired {
            trace!(
                request_id = request.context().request_id(),
                key = %request.key(),
                abandoned = request.is_abandoned(),
                "Suspended request expired"
            );
            request.complete(None);
        }

        if count > 0 {
            debug!(count, "Cleaned expired suspended requests");
            counter!(LONG_POLLING_RESOLVED_REQUESTS, "outcome" => OUTCOME_EXPIRED)
                .increment(count as u64);
        }
        count
    }

    /// Number of requests currently waiting. Requests being retried after a notification are
    /// not included.
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Starts the background task cleaning expired requests every
    /// [`Options::clean_interval`]. The task stops on [`Self::shutdown`] or once every handle
    /// to the service is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sweeper = ExpirationSweeper::new(
            self.downgrade(),
            self.inner.options.clean_interval(),
            self.inner.shutdown.child_token(),
        );
        self.inner.runtime.spawn(sweeper.run())
    }

    /// Stops the sweeper, rejects further suspensions and resolves every waiting request with
    /// `None`.
    pub fn shutdown(&self) {
        debug!("Shutting down long polling service");
        self.inner.shutdown.cancel();
        self.inner.resolve_all_on_shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn downgrade(&self) -> WeakSuspendRequestService<R> {
        WeakSuspendRequestService {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &SuspensionRegistry<R> {
        &self.inner.registry
    }
}

/// Poll timeouts too large to be represented end up roughly 30 years out.
fn deadline_after(poll_timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(poll_timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

impl<R: PollResult> ServiceInner<R> {
    fn on_arrival(this: &Arc<Self>, key: &QueueKey, tag: &str) {
        let claims = this.registry.drain_matching(key, tag);
        if claims.is_empty() {
            trace!(%key, tag, "No suspended request matches arrived message");
            return;
        }

        trace!(
            %key,
            tag,
            count = claims.len(),
            "Retrying suspended requests after message arrival"
        );
        for claim in claims {
            this.runtime.spawn(Self::retry(Arc::clone(this), claim));
        }
    }

    /// Drives a claimed request until it is either resolved or back in the registry.
    async fn retry(this: Arc<Self>, mut claim: Claim<R>) {
        loop {
            let now = Instant::now();
            if claim.request.is_expired(now) || claim.request.is_abandoned() {
                this.finish(claim, None, OUTCOME_EXPIRED);
                return;
            }

            let request = &claim.request;
            // a panicking supplier must not leave the claim in flight
            let fetch = AssertUnwindSafe(async { request.supply(request.remaining(now)).await })
                .catch_unwind();
            let attempt = tokio::time::timeout_at(request.deadline(), fetch)
                .await
                .map(|fetched| {
                    fetched.unwrap_or_else(|_| Err(anyhow::anyhow!("supplier panicked")))
                });

            match attempt {
                Ok(Ok(result)) if result.needs_response() => {
                    this.finish(claim, Some(result), OUTCOME_DELIVERED);
                    return;
                }
                Ok(Ok(_)) => {
                    trace!(
                        request_id = request.context().request_id(),
                        key = %request.key(),
                        "Nothing to deliver after message arrival"
                    );
                }
                Ok(Err(err)) => {
                    counter!(LONG_POLLING_SUPPLIER_FAILURES).increment(1);
                    warn!(
                        %err,
                        request_id = request.context().request_id(),
                        client_id = request.context().client_id(),
                        key = %request.key(),
                        "Failed to fetch messages for suspended request"
                    );
                }
                Err(_elapsed) => {
                    debug!(
                        request_id = request.context().request_id(),
                        key = %request.key(),
                        "Poll timeout elapsed while fetching messages"
                    );
                    this.finish(claim, None, OUTCOME_EXPIRED);
                    return;
                }
            }

            if this.shutdown.is_cancelled() {
                this.finish(claim, None, OUTCOME_SHUTDOWN);
                return;
            }
            if claim.request.is_expired(Instant::now()) {
                this.finish(claim, None, OUTCOME_EXPIRED);
                return;
            }

            match this.registry.rearm(claim) {
                Ok(()) => {
                    counter!(LONG_POLLING_REARMED_REQUESTS).increment(1);
                    if this.shutdown.is_cancelled() {
                        this.resolve_all_on_shutdown();
                    }
                    return;
                }
                Err(refused) => {
                    trace!(
                        request_id = refused.request.context().request_id(),
                        key = %refused.request.key(),
                        "Matching message arrived during fetch, retrying"
                    );
                    claim = refused;
                }
            }
        }
    }

    fn finish(&self, claim: Claim<R>, result: Option<R>, outcome: &'static str) {
        let Claim { id, request } = claim;
        let key = request.key().clone();
        trace!(
            request_id = request.context().request_id(),
            %key,
            outcome,
            "Resolving suspended request"
        );
        request.complete(result);
        self.registry.release(&key, id);
        counter!(LONG_POLLING_RESOLVED_REQUESTS, "outcome" => outcome).increment(1);
    }

    fn resolve_all_on_shutdown(&self) {
        let drained = self.registry.drain_all();
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        for request in drained {
            request.complete(None);
        }
        debug!(count, "Resolved suspended requests on shutdown");
        counter!(LONG_POLLING_RESOLVED_REQUESTS, "outcome" => OUTCOME_SHUTDOWN)
            .increment(count as u64);
    }
}

impl<R: PollResult> fmt::Debug for SuspendRequestService<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendRequestService")
            .field("registry", &self.inner.registry)
            .field("options", &self.inner.options)
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

/// Handle that does not keep the service alive.
pub(crate) struct WeakSuspendRequestService<R> {
    inner: Weak<ServiceInner<R>>,
}

impl<R> WeakSuspendRequestService<R> {
    pub(crate) fn upgrade(&self) -> Option<SuspendRequestService<R>> {
        self.inner
            .upgrade()
            .map(|inner| SuspendRequestService { inner })
    }
}
