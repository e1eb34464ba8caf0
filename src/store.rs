//! Storage for user profiles and unveiled areas.
//!
//! `save_area` is the single commit point of an import: it replaces the
//! owner's whole record at once or not at all.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::merge::UnveiledArea;
use crate::{OwnerId, UserProfile};

/// Backing store for owners and their unveiled areas.
pub trait AreaStore: Send + Sync {
    fn load_user(&self, user_id: &str) -> Result<Option<UserProfile>>;

    fn save_user(&self, profile: &UserProfile) -> Result<()>;

    fn load_area(&self, owner: &OwnerId) -> Result<Option<UnveiledArea>>;

    /// Atomically replace the stored area for `area.owner`.
    fn save_area(&self, area: &UnveiledArea) -> Result<()>;

    /// Areas for every region the user has explored, ordered by region id.
    fn list_areas_for_user(&self, user_id: &str) -> Result<Vec<UnveiledArea>>;
}

/// In-process [`AreaStore`].
#[derive(Debug, Default)]
pub struct MemoryAreaStore {
    users: RwLock<HashMap<String, UserProfile>>,
    areas: RwLock<HashMap<OwnerId, UnveiledArea>>,
}

impl MemoryAreaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn area_count(&self) -> usize {
        self.areas.read().map(|a| a.len()).unwrap_or_default()
    }
}

impl AreaStore for MemoryAreaStore {
    fn load_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        Ok(users.get(user_id).cloned())
    }

    fn save_user(&self, profile: &UserProfile) -> Result<()> {
        let mut users = self.users.write().unwrap_or_else(|e| e.into_inner());
        users.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    fn load_area(&self, owner: &OwnerId) -> Result<Option<UnveiledArea>> {
        let areas = self.areas.read().unwrap_or_else(|e| e.into_inner());
        Ok(areas.get(owner).cloned())
    }

    fn save_area(&self, area: &UnveiledArea) -> Result<()> {
        let mut areas = self.areas.write().unwrap_or_else(|e| e.into_inner());
        areas.insert(area.owner.clone(), area.clone());
        Ok(())
    }

    fn list_areas_for_user(&self, user_id: &str) -> Result<Vec<UnveiledArea>> {
        let areas = self.areas.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<UnveiledArea> = areas
            .values()
            .filter(|a| a.owner.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.owner.region_id);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryAreaStore::new();
        assert!(store.load_user("u-1").unwrap().is_none());

        let mut profile = UserProfile::new("u-1");
        profile.region_id = Some(2);
        store.save_user(&profile).unwrap();
        assert_eq!(store.load_user("u-1").unwrap(), Some(profile));

        let mut area = UnveiledArea::empty(OwnerId::new("u-1", 2));
        area.covered_street_ids.insert("s-1".to_string());
        store.save_area(&area).unwrap();
        store.save_area(&UnveiledArea::empty(OwnerId::new("u-1", 1))).unwrap();
        store.save_area(&UnveiledArea::empty(OwnerId::new("u-2", 1))).unwrap();

        assert_eq!(store.load_area(&OwnerId::new("u-1", 2)).unwrap(), Some(area));
        let regions: Vec<u32> = store
            .list_areas_for_user("u-1")
            .unwrap()
            .iter()
            .map(|a| a.owner.region_id)
            .collect();
        assert_eq!(regions, vec![1, 2]);
        assert_eq!(store.area_count(), 3);
    }
}
