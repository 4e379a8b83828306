// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::request::PollResult;
use crate::service::WeakSuspendRequestService;

const MIN_CLEAN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically resolves suspended requests whose poll timeout elapsed.
pub(crate) struct ExpirationSweeper<R> {
    service: WeakSuspendRequestService<R>,
    clean_interval: Duration,
    cancellation: CancellationToken,
}

impl<R: PollResult> ExpirationSweeper<R> {
    pub(crate) fn new(
        service: WeakSuspendRequestService<R>,
        clean_interval: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            service,
            clean_interval: clean_interval.max(MIN_CLEAN_INTERVAL),
            cancellation,
        }
    }

    pub(crate) async fn run(self) {
        debug!(clean_interval = ?self.clean_interval, "Running the expiration sweeper");

        let mut ticker = tokio::time::interval(self.clean_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    debug!("Expiration sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(service) = self.service.upgrade() else {
                        debug!("Long polling service dropped, stopping expiration sweeper");
                        break;
                    };
                    service.clean_expired_requests();
                }
            }
        }
    }
}
