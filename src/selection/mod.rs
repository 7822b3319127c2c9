//! Read preferences and the pure node-selection policies built on top of them.

mod selector;

pub use selector::NodeSelector;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::node::TagSet;

/// Default width of the latency window used to break ties among otherwise-acceptable nodes,
/// overridable per-cluster via [`crate::config::ClusterConfig::local_threshold`].
pub(crate) const DEFAULT_LATENCY_WINDOW: Duration = Duration::from_millis(15);

/// Caller-supplied policy selecting which role/tagset of nodes may service an operation.
///
/// Immutable once constructed; a [`crate::session::Session`] is handed a `ReadPreference` per
/// call to `create_channel_provider` and never mutates it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,
    /// Only route this operation to a secondary.
    Secondary(ReadPreferenceOptions),
    /// Route to the primary if available, falling back to secondaries otherwise.
    PrimaryPreferred(ReadPreferenceOptions),
    /// Route to a secondary if one is available, falling back to the primary otherwise.
    SecondaryPreferred(ReadPreferenceOptions),
    /// Route to whichever data-bearing node (primary or secondary) has the lowest measured
    /// latency.
    Nearest(ReadPreferenceOptions),
}

/// Tag-set and max-staleness qualifiers attached to every non-`Primary` read preference mode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadPreferenceOptions {
    /// Ordered list of tag maps, applied first-match: the first tag set with at least one
    /// matching node wins and the rest are not considered.
    pub tag_sets: Vec<TagSet>,
    /// The maximum number of seconds a secondary may lag the primary and still be eligible.
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub fn secondary() -> Self {
        ReadPreference::Secondary(ReadPreferenceOptions::default())
    }

    pub fn secondary_preferred() -> Self {
        ReadPreference::SecondaryPreferred(ReadPreferenceOptions::default())
    }

    pub fn primary_preferred() -> Self {
        ReadPreference::PrimaryPreferred(ReadPreferenceOptions::default())
    }

    pub fn nearest() -> Self {
        ReadPreference::Nearest(ReadPreferenceOptions::default())
    }

    pub fn with_tag_sets(self, tag_sets: Vec<TagSet>) -> Self {
        self.map_options(|mut opts| {
            opts.tag_sets = tag_sets;
            opts
        })
    }

    pub fn with_max_staleness(self, max_staleness: Duration) -> Self {
        self.map_options(|mut opts| {
            opts.max_staleness = Some(max_staleness);
            opts
        })
    }

    fn map_options(self, f: impl FnOnce(ReadPreferenceOptions) -> ReadPreferenceOptions) -> Self {
        match self {
            ReadPreference::Primary => ReadPreference::Primary,
            ReadPreference::Secondary(o) => ReadPreference::Secondary(f(o)),
            ReadPreference::PrimaryPreferred(o) => ReadPreference::PrimaryPreferred(f(o)),
            ReadPreference::SecondaryPreferred(o) => ReadPreference::SecondaryPreferred(f(o)),
            ReadPreference::Nearest(o) => ReadPreference::Nearest(f(o)),
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary(o)
            | ReadPreference::PrimaryPreferred(o)
            | ReadPreference::SecondaryPreferred(o)
            | ReadPreference::Nearest(o) => Some(o),
        }
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|o| o.max_staleness)
    }

    pub fn tag_sets(&self) -> &[TagSet] {
        self.options().map(|o| o.tag_sets.as_slice()).unwrap_or(&[])
    }
}
