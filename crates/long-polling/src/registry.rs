// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Index of suspended requests keyed by topic and queue.
//!
//! Removing a request from the registry transfers the right to resolve it to the caller of the
//! removing operation. Every drain happens under the lock of the affected bucket, so the
//! notification path and the expiration sweeper can never both obtain the same request.
//!
//! Requests taken by a notification become [`Claim`]s. The bucket keeps the filter of every
//! claim until the claim is either completed ([`SuspensionRegistry::release`]) or put back
//! ([`SuspensionRegistry::rearm`]). A later arrival whose tag passes a claim's filter flags the
//! claim, and re-arming a flagged claim is refused. A message that became visible while the
//! supplier was running is therefore never missed, while arrivals the filter rejects leave the
//! claim alone.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytestring::ByteString;
use metrics::gauge;
use tokio::time::Instant;

use crate::filter::MessageFilter;
use crate::metric_definitions::LONG_POLLING_SUSPENDED_REQUESTS;
use crate::request::{PollResult, SuspendedRequest};

type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// Identifies a request claimed by an arrival notification.
pub type ClaimId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    topic: ByteString,
    queue_id: i32,
}

impl QueueKey {
    pub fn new(topic: impl Into<ByteString>, queue_id: i32) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_id(&self) -> i32 {
        self.queue_id
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.queue_id)
    }
}

struct InFlight {
    id: ClaimId,
    filter: Arc<dyn MessageFilter>,
    // a matching message arrived after the claim was taken
    rearrived: bool,
}

struct Bucket<R> {
    requests: Vec<SuspendedRequest<R>>,
    in_flight: Vec<InFlight>,
}

impl<R> Default for Bucket<R> {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            in_flight: Vec::new(),
        }
    }
}

impl<R> Bucket<R> {
    fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.in_flight.is_empty()
    }
}

/// A request taken out of the registry by an arrival notification.
///
/// The claim stays tracked by its bucket until it is passed to [`SuspensionRegistry::rearm`]
/// or its id to [`SuspensionRegistry::release`].
#[derive(Debug)]
pub struct Claim<R> {
    pub(crate) id: ClaimId,
    pub(crate) request: SuspendedRequest<R>,
}

impl<R> Claim<R> {
    pub fn id(&self) -> ClaimId {
        self.id
    }

    pub fn request(&self) -> &SuspendedRequest<R> {
        &self.request
    }
}

pub struct SuspensionRegistry<R> {
    buckets: DashMap<QueueKey, Bucket<R>>,
    len: AtomicUsize,
    next_claim: AtomicU64,
}

impl<R: PollResult> Default for SuspensionRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: PollResult> SuspensionRegistry<R> {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::default(),
            len: AtomicUsize::new(0),
            next_claim: AtomicU64::new(1),
        }
    }

    /// Number of indexed requests. Claimed requests are not counted until re-armed.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, request: SuspendedRequest<R>) {
        let mut bucket = self.buckets.entry(request.key().clone()).or_default();
        bucket.requests.push(request);
        self.add_len(1);
    }

    /// Claims every request of `key` whose filter accepts `tag`, and flags the claims already
    /// in flight whose filter accepts it.
    pub fn drain_matching(&self, key: &QueueKey, tag: &str) -> Vec<Claim<R>> {
        let claims = {
            let Some(mut bucket) = self.buckets.get_mut(key) else {
                return Vec::new();
            };
            let bucket = &mut *bucket;

            for in_flight in &mut bucket.in_flight {
                if in_flight.filter.matches(tag) {
                    in_flight.rearrived = true;
                }
            }

            let (matching, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut bucket.requests)
                .into_iter()
                .partition(|request| request.matches(tag));
            bucket.requests = kept;
            self.sub_len(matching.len());

            matching
                .into_iter()
                .map(|request| {
                    let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
                    bucket.in_flight.push(InFlight {
                        id,
                        filter: Arc::clone(request.filter()),
                        rearrived: false,
                    });
                    Claim { id, request }
                })
                .collect::<Vec<_>>()
        };

        self.remove_if_idle(key);
        claims
    }

    /// Puts back a claim whose retry found nothing.
    ///
    /// Fails, handing the claim back, if a message passing the claim's filter arrived since the
    /// claim was taken or last handed back. The claim stays in flight in that case.
    pub fn rearm(&self, claim: Claim<R>) -> Result<(), Claim<R>> {
        let mut bucket = self.buckets.entry(claim.request.key().clone()).or_default();

        if let Some(pos) = bucket.in_flight.iter().position(|c| c.id == claim.id) {
            let in_flight = &mut bucket.in_flight[pos];
            if in_flight.rearrived {
                in_flight.rearrived = false;
                return Err(claim);
            }
            bucket.in_flight.swap_remove(pos);
        }

        bucket.requests.push(claim.request);
        self.add_len(1);
        Ok(())
    }

    /// Marks the claim `id` of queue `key` as resolved.
    pub fn release(&self, key: &QueueKey, id: ClaimId) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.in_flight.retain(|in_flight| in_flight.id != id);
        }
        self.remove_if_idle(key);
    }

    /// Removes every request whose deadline is at or before `now`, along with requests whose
    /// caller has stopped waiting.
    pub fn drain_expired(&self, now: Instant) -> Vec<SuspendedRequest<R>> {
        let mut expired = Vec::new();

        for mut bucket in self.buckets.iter_mut() {
            if !bucket
                .requests
                .iter()
                .any(|request| request.is_expired(now) || request.is_abandoned())
            {
                continue;
            }

            let (drained, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut bucket.requests)
                .into_iter()
                .partition(|request| request.is_expired(now) || request.is_abandoned());
            bucket.requests = kept;
            self.sub_len(drained.len());
            expired.extend(drained);
        }

        self.buckets.retain(|_, bucket| !bucket.is_idle());
        expired
    }

    /// Removes every indexed request. Claims in flight are left to their current owner.
    pub fn drain_all(&self) -> Vec<SuspendedRequest<R>> {
        let mut drained = Vec::new();

        for mut bucket in self.buckets.iter_mut() {
            let requests = std::mem::take(&mut bucket.requests);
            self.sub_len(requests.len());
            drained.extend(requests);
        }

        self.buckets.retain(|_, bucket| !bucket.is_idle());
        drained
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    pub(crate) fn in_flight_count(&self, key: &QueueKey) -> usize {
        self.buckets
            .get(key)
            .map_or(0, |bucket| bucket.in_flight.len())
    }

    fn remove_if_idle(&self, key: &QueueKey) {
        self.buckets.remove_if(key, |_, bucket| bucket.is_idle());
    }

    fn add_len(&self, n: usize) {
        self.len.fetch_add(n, Ordering::AcqRel);
        gauge!(LONG_POLLING_SUSPENDED_REQUESTS).increment(n as f64);
    }

    fn sub_len(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.len.fetch_sub(n, Ordering::AcqRel);
        gauge!(LONG_POLLING_SUSPENDED_REQUESTS).decrement(n as f64);
    }
}

impl<R: PollResult> fmt::Debug for SuspensionRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspensionRegistry")
            .field("len", &self.len())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use googletest::prelude::*;
    use test_log::test;

    use crate::filter::Filter;
    use crate::request::{PollResult, RequestContext, SuspendedPoll};

    #[derive(Debug)]
    struct Empty;

    impl PollResult for Empty {
        fn needs_response(&self) -> bool {
            false
        }
    }

    fn request(
        topic: &str,
        queue_id: i32,
        filter: Filter,
        deadline: Instant,
    ) -> (SuspendedRequest<Empty>, SuspendedPoll<Empty>) {
        SuspendedRequest::new(
            RequestContext::new(),
            QueueKey::new(topic, queue_id),
            Arc::new(filter),
            deadline,
            Arc::new(|_remaining: Duration| async { anyhow::Ok(Empty) }),
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn insert_counts_requests() {
        let registry = SuspensionRegistry::new();
        assert!(registry.is_empty());

        let (a, _poll_a) = request("topic", 0, Filter::All, far_deadline());
        let (b, _poll_b) = request("topic", 1, Filter::All, far_deadline());
        let (c, _poll_c) = request("topic", 0, Filter::tag("tagA"), far_deadline());
        registry.insert(a);
        registry.insert(b);
        registry.insert(c);

        assert_that!(registry.len(), eq(3));
        assert_that!(registry.bucket_count(), eq(2));
    }

    #[test]
    fn drain_matching_leaves_other_tags_and_queues() {
        let registry = SuspensionRegistry::new();
        let (tag_a, _poll_a) = request("topic", 0, Filter::tag("tagA"), far_deadline());
        let (tag_b, _poll_b) = request("topic", 0, Filter::tag("tagB"), far_deadline());
        let (other_queue, _poll_c) = request("topic", 1, Filter::tag("tagA"), far_deadline());
        let tag_a_id = tag_a.context().request_id();
        registry.insert(tag_a);
        registry.insert(tag_b);
        registry.insert(other_queue);

        let claimed = registry.drain_matching(&QueueKey::new("topic", 0), "tagA");

        assert_that!(claimed.len(), eq(1));
        assert_that!(claimed[0].request().context().request_id(), eq(tag_a_id));
        assert_that!(registry.len(), eq(2));
    }

    #[test]
    fn drain_matching_unknown_queue_is_empty() {
        let registry = SuspensionRegistry::<Empty>::new();
        let claimed = registry.drain_matching(&QueueKey::new("topic", 0), "tagA");
        assert!(claimed.is_empty());
        assert_that!(registry.bucket_count(), eq(0));
    }

    #[test]
    fn drain_matching_accept_all() {
        let registry = SuspensionRegistry::new();
        for _ in 0..3 {
            let (r, poll) = request("topic", 0, Filter::All, far_deadline());
            registry.insert(r);
            drop(poll);
        }

        let claimed = registry.drain_matching(&QueueKey::new("topic", 0), "anything");
        assert_that!(claimed.len(), eq(3));
        assert!(registry.is_empty());
        // claimed requests keep the bucket alive until they are released
        assert_that!(registry.bucket_count(), eq(1));

        for claim in claimed {
            let key = claim.request().key().clone();
            let id = claim.id();
            claim.request.complete(None);
            registry.release(&key, id);
        }
        assert_that!(registry.bucket_count(), eq(0));
    }

    #[test]
    fn drain_expired_only_takes_due_requests() {
        let registry = SuspensionRegistry::new();
        let now = Instant::now();
        let (due, _poll_due) = request("topic", 0, Filter::All, now);
        let (later, _poll_later) = request("topic", 0, Filter::All, far_deadline());
        let (due_elsewhere, _poll_elsewhere) =
            request("other", 3, Filter::All, now - Duration::from_millis(1));
        registry.insert(due);
        registry.insert(later);
        registry.insert(due_elsewhere);

        let expired = registry.drain_expired(now);

        assert_that!(expired.len(), eq(2));
        assert_that!(registry.len(), eq(1));
        // the bucket of "other" became empty
        assert_that!(registry.bucket_count(), eq(1));
    }

    #[test]
    fn drain_expired_collects_abandoned_requests() {
        let registry = SuspensionRegistry::new();
        let (abandoned, poll) = request("topic", 0, Filter::All, far_deadline());
        registry.insert(abandoned);
        drop(poll);

        let drained = registry.drain_expired(Instant::now());
        assert_that!(drained.len(), eq(1));
        assert!(registry.is_empty());
        assert_that!(registry.bucket_count(), eq(0));
    }

    #[test]
    fn rearm_puts_request_back() {
        let registry = SuspensionRegistry::new();
        let key = QueueKey::new("topic", 0);
        let (r, _poll) = request("topic", 0, Filter::All, far_deadline());
        registry.insert(r);

        let mut claimed = registry.drain_matching(&key, "tagA");
        assert!(registry.is_empty());
        assert_that!(registry.in_flight_count(&key), eq(1));

        let claim = claimed.pop().unwrap();
        assert!(registry.rearm(claim).is_ok());
        assert_that!(registry.len(), eq(1));
        assert_that!(registry.in_flight_count(&key), eq(0));
    }

    #[test]
    fn rearm_refused_after_matching_arrival() {
        let registry = SuspensionRegistry::new();
        let key = QueueKey::new("topic", 0);
        let (r, _poll) = request("topic", 0, Filter::tag("tagA"), far_deadline());
        registry.insert(r);

        let mut claimed = registry.drain_matching(&key, "tagA");
        // another tagA message arrives while the supplier of the claim is running
        assert!(registry.drain_matching(&key, "tagA").is_empty());

        let claim = registry.rearm(claimed.pop().unwrap()).unwrap_err();
        assert!(registry.is_empty());
        assert_that!(registry.in_flight_count(&key), eq(1));

        // the flag is consumed by the refusal
        assert!(registry.rearm(claim).is_ok());
        assert_that!(registry.len(), eq(1));
        assert_that!(registry.in_flight_count(&key), eq(0));
    }

    #[test]
    fn rearm_ignores_arrivals_rejected_by_filter() {
        let registry = SuspensionRegistry::new();
        let key = QueueKey::new("topic", 0);
        let (r, _poll) = request("topic", 0, Filter::tag("tagA"), far_deadline());
        registry.insert(r);

        let mut claimed = registry.drain_matching(&key, "tagA");
        for _ in 0..10 {
            assert!(registry.drain_matching(&key, "tagB").is_empty());
        }

        assert!(registry.rearm(claimed.pop().unwrap()).is_ok());
        assert_that!(registry.len(), eq(1));
    }

    #[test]
    fn arrivals_only_flag_matching_claims() {
        let registry = SuspensionRegistry::new();
        let key = QueueKey::new("topic", 0);
        let (tag_a, _poll_a) = request("topic", 0, Filter::tag("tagA"), far_deadline());
        let (tag_b, _poll_b) = request("topic", 0, Filter::tag("tagB"), far_deadline());
        registry.insert(tag_a);
        registry.insert(tag_b);

        let mut claimed = registry.drain_matching(&key, "tagA");
        claimed.extend(registry.drain_matching(&key, "tagB"));
        assert_that!(claimed.len(), eq(2));

        // only the tagB claim saw a second matching arrival
        assert!(registry.drain_matching(&key, "tagB").is_empty());

        let claim_b = claimed.pop().unwrap();
        let claim_a = claimed.pop().unwrap();
        assert!(registry.rearm(claim_a).is_ok());
        assert!(registry.rearm(claim_b).is_err());
    }

    #[test]
    fn released_claims_free_the_bucket() {
        let registry = SuspensionRegistry::new();
        let key = QueueKey::new("topic", 0);
        let (r, _poll) = request("topic", 0, Filter::All, far_deadline());
        registry.insert(r);

        let claim = registry.drain_matching(&key, "tagA").pop().unwrap();
        assert_that!(registry.bucket_count(), eq(1));

        registry.release(&key, claim.id());
        assert_that!(registry.in_flight_count(&key), eq(0));
        assert_that!(registry.bucket_count(), eq(0));
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = SuspensionRegistry::new();
        let mut polls = Vec::new();
        for queue_id in 0..4 {
            let (r, poll) = request("topic", queue_id, Filter::All, far_deadline());
            registry.insert(r);
            polls.push(poll);
        }

        let drained = registry.drain_all();
        assert_that!(drained.len(), eq(4));
        assert!(registry.is_empty());
        assert_that!(registry.bucket_count(), eq(0));
    }

    #[test]
    fn concurrent_drains_never_share_a_request() {
        let registry = Arc::new(SuspensionRegistry::new());
        let key = QueueKey::new("topic", 0);
        let now = Instant::now();
        let mut polls = Vec::new();
        for _ in 0..1_000 {
            let (r, poll) = request("topic", 0, Filter::All, now);
            registry.insert(r);
            polls.push(poll);
        }

        let notifiers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..100 {
                        let claimed = registry.drain_matching(&key, "tagA");
                        ids.extend(claimed.iter().map(|c| c.request().context().request_id()));
                    }
                    ids
                })
            })
            .collect();
        let sweepers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..100 {
                        let expired = registry.drain_expired(now);
                        ids.extend(expired.iter().map(|r| r.context().request_id()));
                    }
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in notifiers.into_iter().chain(sweepers) {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "request {id} drained twice");
            }
        }
        assert_that!(seen.len(), eq(1_000));
        assert!(registry.is_empty());
    }
}
