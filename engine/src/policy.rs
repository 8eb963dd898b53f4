//! Overwrite policy resolution.

use crate::model::{ConflictKind, Decision, OverwritePolicy};

/// Decides what happens when a destination name already exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverwritePolicyResolver;

impl OverwritePolicyResolver {
    pub fn new() -> Self {
        OverwritePolicyResolver
    }

    /// `Replace` merges into a conflicting folder or replaces a conflicting file.
    pub fn resolve(&self, policy: OverwritePolicy, conflict: ConflictKind) -> Decision {
        let replace = match conflict {
            ConflictKind::FileConflict => {
                matches!(policy, OverwritePolicy::Files | OverwritePolicy::All)
            }
            ConflictKind::FolderConflict => {
                matches!(policy, OverwritePolicy::Folders | OverwritePolicy::All)
            }
        };
        if replace {
            Decision::Replace
        } else {
            Decision::Fail
        }
    }
}
