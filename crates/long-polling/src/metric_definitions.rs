// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_gauge};

pub const LONG_POLLING_SUSPENDED_REQUESTS: &str = "mqproxy.long_polling.suspended_requests";
pub const LONG_POLLING_SUSPEND_REQUESTS: &str = "mqproxy.long_polling.suspend_requests.total";
pub const LONG_POLLING_RESOLVED_REQUESTS: &str = "mqproxy.long_polling.resolved_requests.total";
pub const LONG_POLLING_REARMED_REQUESTS: &str = "mqproxy.long_polling.rearmed_requests.total";
pub const LONG_POLLING_SUPPLIER_FAILURES: &str = "mqproxy.long_polling.supplier_failures.total";

pub const OUTCOME_SUSPENDED: &str = "suspended";
pub const OUTCOME_IMMEDIATE: &str = "immediate";
pub const OUTCOME_REJECTED: &str = "rejected";
pub const OUTCOME_DELIVERED: &str = "delivered";
pub const OUTCOME_EXPIRED: &str = "expired";
pub const OUTCOME_SHUTDOWN: &str = "shutdown";

pub(crate) fn describe_metrics() {
    describe_gauge!(
        LONG_POLLING_SUSPENDED_REQUESTS,
        Unit::Count,
        "Number of long-poll requests currently waiting for a message"
    );
    describe_counter!(
        LONG_POLLING_SUSPEND_REQUESTS,
        Unit::Count,
        "Number of suspend calls, by outcome"
    );
    describe_counter!(
        LONG_POLLING_RESOLVED_REQUESTS,
        Unit::Count,
        "Number of suspended requests resolved, by outcome"
    );
    describe_counter!(
        LONG_POLLING_REARMED_REQUESTS,
        Unit::Count,
        "Number of notified requests that found nothing and went back to waiting"
    );
    describe_counter!(
        LONG_POLLING_SUPPLIER_FAILURES,
        Unit::Count,
        "Number of failed fetch attempts of notified requests"
    );
}
