//! Section grouping.
//!
//! Input sections of an output section are partitioned, in layout order,
//! into groups that share one stub table. The group byte budget keeps every
//! member within direct-branch range of its table; the table is appended to
//! the group's last member (the owner).

use alloc::vec::Vec;

use crate::section::SectionId;
use crate::stub::MAX_BRANCH_OFFSET;

/// Default group budget: the direct-branch span less headroom for the stub
/// table itself (room for roughly 4096 stub words).
pub const DEFAULT_GROUP_BUDGET: u64 = (MAX_BRANCH_OFFSET - 4096 * 4) as u64;

/// One stub-table group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Member sections in layout order.
    pub sections: Vec<SectionId>,
    /// The member whose tail carries the stub table.
    pub owner: SectionId,
}

/// Partition `members` (layout order, with sizes) into groups.
///
/// A group closes at the section whose addition first reaches `budget`, and
/// that section becomes the owner. With `stubs_after_branch` unset the group
/// instead keeps extending past the owner for up to another budget's worth
/// of bytes, so sections after the table can still reach it backwards.
/// Zero-size sections never need stubs and are left out entirely.
pub(crate) fn group_sections(
    members: &[(SectionId, u64)],
    budget: u64,
    stubs_after_branch: bool,
) -> Vec<Group> {
    let mut groups = Vec::new();
    let mut sections: Vec<SectionId> = Vec::new();
    let mut owner: Option<SectionId> = None;
    let mut acc = 0u64;

    for &(id, size) in members {
        if size == 0 {
            continue;
        }
        sections.push(id);
        acc = acc.saturating_add(size);
        if acc < budget {
            continue;
        }
        if owner.is_none() {
            owner = Some(id);
            acc = 0;
            if !stubs_after_branch {
                // Keep extending behind the table before closing.
                continue;
            }
        }
        groups.push(Group {
            sections: core::mem::take(&mut sections),
            owner: owner.take().unwrap_or(id),
        });
        acc = 0;
    }
    if let Some(&last) = sections.last() {
        groups.push(Group {
            sections,
            owner: owner.unwrap_or(last),
        });
    }
    groups
}
