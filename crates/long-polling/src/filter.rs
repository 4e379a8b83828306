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

use bytestring::ByteString;

/// Pre-filter deciding whether a newly visible message could satisfy a suspended request.
///
/// Evaluating the actual subscription expression is the job of the message store. This check
/// only needs to be cheap and must never reject a message the supplier would deliver.
pub trait MessageFilter: fmt::Debug + Send + Sync + 'static {
    fn matches(&self, tag: &str) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Filter {
    /// Accepts every message.
    #[default]
    All,
    /// Accepts messages carrying exactly this tag.
    Tag(ByteString),
}

impl Filter {
    pub fn tag(expected: impl Into<ByteString>) -> Self {
        Filter::Tag(expected.into())
    }
}

impl MessageFilter for Filter {
    fn matches(&self, tag: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Tag(expected) => expected == tag,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => f.write_str("*"),
            Filter::Tag(expected) => write!(f, "tag={expected}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_accepts_any_tag() {
        let filter = Filter::All;
        assert!(filter.matches("tagA"));
        assert!(filter.matches(""));
    }

    #[test]
    fn tag_filter_is_exact() {
        let filter = Filter::tag("tagA");
        assert!(filter.matches("tagA"));
        assert!(!filter.matches("tagB"));
        assert!(!filter.matches("taga"));
        assert!(!filter.matches(""));
    }

    #[test]
    fn default_is_all() {
        assert_eq!(Filter::default(), Filter::All);
        assert_eq!(Filter::default().to_string(), "*");
        assert_eq!(Filter::tag("tagA").to_string(), "tag=tagA");
    }
}
