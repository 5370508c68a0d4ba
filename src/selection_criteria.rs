//! Types for specifying which server an operation should be routed to.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::sdam::ServerDescription;

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that determines suitability by server role and tags.
    ReadPreference(ReadPreference),

    /// An arbitrary predicate over server descriptions. Only data-bearing servers (or the
    /// single server of a direct connection) are passed to the predicate.
    Predicate(Predicate),
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ReadPreference(read_pref) => write!(f, "ReadPreference({:?})", read_pref),
            Self::Predicate(..) => write!(f, "Predicate"),
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

/// A predicate over server descriptions used for custom server selection.
pub type Predicate = Arc<dyn Fn(&ServerDescription) -> bool + Send + Sync>;

/// A single set of tags a server must carry in full to match.
pub type TagSet = HashMap<String, String>;

/// Specifies how the driver routes read operations among the members of a replica set.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Additional options.
        options: ReadPreferenceOptions,
    },

    /// Route to the primary if available, otherwise any eligible secondary.
    PrimaryPreferred {
        /// Additional options.
        options: ReadPreferenceOptions,
    },

    /// Route to an eligible secondary if one exists, otherwise the primary.
    SecondaryPreferred {
        /// Additional options.
        options: ReadPreferenceOptions,
    },

    /// Route to the eligible server with the lowest latency, regardless of role.
    Nearest {
        /// Additional options.
        options: ReadPreferenceOptions,
    },
}

/// Options shared by the non-primary read preference modes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tag sets tried in order; the first set matched by at least one eligible server wins,
    /// and only servers carrying every tag of that set remain eligible.
    #[serde(rename = "tags")]
    pub tag_sets: Option<Vec<TagSet>>,
}

impl ReadPreference {
    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        match self {
            Self::Primary => None,
            Self::Secondary { ref options }
            | Self::PrimaryPreferred { ref options }
            | Self::SecondaryPreferred { ref options }
            | Self::Nearest { ref options } => options.tag_sets.as_ref(),
        }
    }

    /// The mode string used when attaching a `$readPreference` document to a command.
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    /// Whether this mode permits reading from a non-primary, which on the legacy framing is
    /// signalled via the slaveOk query flag.
    pub(crate) fn allows_secondary(&self) -> bool {
        !matches!(self, Self::Primary)
    }

    pub(crate) fn to_document(&self) -> crate::bson::Document {
        let mut doc = crate::bson::doc! { "mode": self.mode() };
        if let Some(tag_sets) = self.tag_sets() {
            let tags: Vec<crate::bson::Bson> = tag_sets
                .iter()
                .map(|set| {
                    crate::bson::Bson::Document(
                        set.iter()
                            .map(|(k, v)| (k.clone(), crate::bson::Bson::String(v.clone())))
                            .collect(),
                    )
                })
                .collect();
            doc.insert("tags", tags);
        }
        doc
    }
}
