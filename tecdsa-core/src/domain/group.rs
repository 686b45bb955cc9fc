use crate::foundation::{MemberId, OperatorError, Result};
use serde::{Deserialize, Serialize};

/// Description of one keep's signing group as agreed on-chain.
///
/// The member list is the exact on-chain membership; order at this interface
/// is irrelevant. The protocol layer sorts members canonically before
/// deriving party indices.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    group_id: String,
    this_member: MemberId,
    members: Vec<MemberId>,
    dishonest_threshold: usize,
}

impl GroupInfo {
    pub fn new(
        group_id: impl Into<String>,
        this_member: MemberId,
        members: Vec<MemberId>,
        dishonest_threshold: usize,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(OperatorError::InvalidGroup("group should have at least one member".to_string()));
        }
        if members.len() <= dishonest_threshold {
            return Err(OperatorError::InvalidGroup(format!(
                "group size [{}], should be greater than dishonest threshold [{}]",
                members.len(),
                dishonest_threshold
            )));
        }
        if !members.contains(&this_member) {
            return Err(OperatorError::InvalidGroup(format!(
                "member [{}] is not part of the group",
                this_member
            )));
        }
        for member in &members {
            if !member.is_positive() {
                return Err(OperatorError::InvalidMember(member.to_string()));
            }
        }
        let mut deduped = members.clone();
        deduped.sort();
        deduped.dedup();
        if deduped.len() != members.len() {
            return Err(OperatorError::InvalidGroup("group members must be unique".to_string()));
        }

        Ok(Self { group_id: group_id.into(), this_member, members, dishonest_threshold })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn this_member(&self) -> &MemberId {
        &self.this_member
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn dishonest_threshold(&self) -> usize {
        self.dishonest_threshold
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    /// Members in canonical (integer) order, the order the protocol layer
    /// assigns party indices in.
    pub fn sorted_members(&self) -> Vec<MemberId> {
        let mut sorted = self.members.clone();
        sorted.sort();
        sorted
    }

    /// This member's position within the canonical ordering. Used for the
    /// on-disk `membership_<N>` file name.
    pub fn this_member_index(&self) -> usize {
        self.sorted_members().iter().position(|m| m == &self.this_member).unwrap_or(0)
    }

    pub fn other_members(&self) -> Vec<MemberId> {
        self.members.iter().filter(|m| *m != &self.this_member).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u8) -> MemberId {
        MemberId::new(vec![n])
    }

    #[test]
    fn rejects_empty_group() {
        let err = GroupInfo::new("keep", member(1), vec![], 0).unwrap_err();
        assert!(err.to_string().contains("at least one member"));
    }

    #[test]
    fn rejects_group_not_larger_than_threshold() {
        let members = vec![member(1), member(2)];
        let err = GroupInfo::new("keep", member(1), members, 2).unwrap_err();
        assert!(err.to_string().contains("greater than dishonest threshold [2]"));
    }

    #[test]
    fn rejects_outsider_this_member() {
        let members = vec![member(1), member(2)];
        assert!(GroupInfo::new("keep", member(3), members, 1).is_err());
    }

    #[test]
    fn rejects_non_positive_member() {
        let members = vec![member(1), MemberId::new(vec![0])];
        let err = GroupInfo::new("keep", member(1), members, 1).unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn rejects_duplicate_members() {
        let members = vec![member(1), member(2), member(2)];
        assert!(GroupInfo::new("keep", member(1), members, 1).is_err());
    }

    #[test]
    fn sorted_members_are_canonical() {
        let members = vec![member(3), member(1), member(2)];
        let group = GroupInfo::new("keep", member(3), members, 1).expect("group");
        assert_eq!(group.sorted_members(), vec![member(1), member(2), member(3)]);
        assert_eq!(group.this_member_index(), 2);
        assert_eq!(group.other_members(), vec![member(1), member(2)]);
    }
}
