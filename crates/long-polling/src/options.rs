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
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::error::BuildError;
use crate::request::PollResult;
use crate::service::SuspendRequestService;

/// # Long polling options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[serde(rename_all = "kebab-case", default)]
#[builder(default, setter(into))]
pub struct Options {
    /// # Minimum poll timeout
    ///
    /// Requests asking to wait for this long or less are answered right away with an empty
    /// result instead of being suspended.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    min_poll_timeout: humantime::Duration,

    /// # Maximum poll timeout
    ///
    /// Longer poll timeouts are capped to this value. Unset means requests wait for the full
    /// poll timeout they asked for.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde(
        with = "serde_with::As::<Option<serde_with::DisplayFromStr>>",
        skip_serializing_if = "Option::is_none"
    )]
    #[builder(setter(into, strip_option))]
    max_poll_timeout: Option<humantime::Duration>,

    /// # Clean interval
    ///
    /// How often suspended requests are checked for expiration. A request is answered at most
    /// this late after its poll timeout elapsed.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    clean_interval: humantime::Duration,

    /// # Suspended requests limit
    ///
    /// Number of requests that can be suspended at the same time. Requests beyond the limit are
    /// rejected. Default is unlimited.
    max_suspended_requests: Option<NonZeroUsize>,
}

impl Options {
    pub fn min_poll_timeout(&self) -> Duration {
        *self.min_poll_timeout
    }

    pub fn max_poll_timeout(&self) -> Option<Duration> {
        self.max_poll_timeout.map(Into::into)
    }

    pub fn clean_interval(&self) -> Duration {
        *self.clean_interval
    }

    pub fn max_suspended_requests(&self) -> Option<NonZeroUsize> {
        self.max_suspended_requests
    }

    /// Creates the service and starts its expiration sweeper. Must be called within a tokio
    /// runtime.
    pub fn build<R: PollResult>(self) -> Result<SuspendRequestService<R>, BuildError> {
        let service = SuspendRequestService::new(self)?;
        service.spawn_sweeper();
        Ok(service)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_poll_timeout: Duration::ZERO.into(),
            max_poll_timeout: None,
            clean_interval: Duration::from_millis(100).into(),
            max_suspended_requests: None,
        }
    }
}
