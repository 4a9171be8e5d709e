use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::IntegrityError;
use crate::state::ResourceState;
use crate::urn::{STACK_TYPE, Urn};

/// Bump when the persisted snapshot layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Metadata written alongside the resources of every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub time: jiff::Timestamp,
    pub version: u32,
    pub engine_version: String,
}

impl Default for SnapshotManifest {
    fn default() -> Self {
        Self {
            time: jiff::Timestamp::now(),
            version: SNAPSHOT_VERSION,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The last-known state of the world: an ordered list of resources in which
/// every entry only refers to entries before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub manifest: SnapshotManifest,
    pub resources: Vec<ResourceState>,
}

impl Snapshot {
    pub fn new(resources: Vec<ResourceState>) -> Self {
        Self {
            manifest: SnapshotManifest::default(),
            resources,
        }
    }

    /// The root stack entry, if the program registered one.
    pub fn root(&self) -> Option<&ResourceState> {
        self.resources
            .first()
            .filter(|r| r.resource_type == STACK_TYPE)
    }

    /// The live (not condemned) entry for `urn`.
    pub fn get(&self, urn: &Urn) -> Option<&ResourceState> {
        self.resources
            .iter()
            .find(|r| &r.urn == urn && !r.pending_delete)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Check the structural invariants of the snapshot.
    ///
    /// - at most one non-condemned entry per URN
    /// - parents, dependencies and `replace_with` targets appear earlier
    /// - a stack root, if present, is the first entry
    /// - no entry is both pending replacement and pending deletion
    ///
    /// `deleted_with` may name a resource that no longer exists; that is how
    /// a resource records that its owner is already gone.
    pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
        let all_urns: HashSet<&Urn> = self.resources.iter().map(|r| &r.urn).collect();
        let mut seen: HashSet<&Urn> = HashSet::with_capacity(self.resources.len());
        let mut live: HashMap<&Urn, usize> = HashMap::with_capacity(self.resources.len());

        for (index, res) in self.resources.iter().enumerate() {
            let urn = &res.urn;

            if res.resource_type == STACK_TYPE && index != 0 {
                return Err(IntegrityError::StackNotFirst {
                    urn: urn.clone(),
                    index,
                });
            }

            if res.pending_replacement && res.pending_delete {
                return Err(IntegrityError::ConflictingPendingFlags { urn: urn.clone() });
            }

            if !res.pending_delete {
                if let Some(&first) = live.get(urn) {
                    return Err(IntegrityError::DuplicateUrn {
                        urn: urn.clone(),
                        first,
                        second: index,
                    });
                }
                live.insert(urn, index);
            }

            if let Some(parent) = &res.parent {
                if !seen.contains(parent) {
                    return Err(if all_urns.contains(parent) {
                        IntegrityError::ParentOutOfOrder {
                            urn: urn.clone(),
                            parent: parent.clone(),
                        }
                    } else {
                        IntegrityError::UnknownParent {
                            urn: urn.clone(),
                            parent: parent.clone(),
                        }
                    });
                }
            }

            for (field, target) in res.references() {
                if field == "deleted_with" || seen.contains(target) {
                    continue;
                }
                return Err(if all_urns.contains(target) {
                    IntegrityError::ReferenceOutOfOrder {
                        urn: urn.clone(),
                        field,
                        target: target.clone(),
                    }
                } else {
                    IntegrityError::UnknownReference {
                        urn: urn.clone(),
                        field,
                        target: target.clone(),
                    }
                });
            }

            seen.insert(urn);
        }

        Ok(())
    }
}
