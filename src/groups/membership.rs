//! Group-membership cache collaborator.

use crate::delivery::CollabFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

pub trait MembershipCache: Send + Sync {
    /// Groups `user_id` belongs to; `None` on a cache miss.
    fn groups_of<'a>(&'a self, user_id: &'a str) -> CollabFuture<'a, Option<Vec<String>>>;

    /// Ask the owner of membership data to repopulate the cache for `user_id`. Must not
    /// wait for the rebuild itself.
    fn request_rebuild<'a>(&'a self, user_id: &'a str) -> CollabFuture<'a, ()>;
}

/// In-process membership cache. Users without an entry are misses and are recorded as
/// rebuild requests.
#[derive(Default)]
pub struct MemoryMembership {
    groups: RwLock<HashMap<String, Vec<String>>>,
    rebuilds: Mutex<Vec<String>>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_groups<I, S>(&self, user_id: &str, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .write()
            .insert(user_id.to_string(), groups.into_iter().map(Into::into).collect());
    }

    pub fn forget(&self, user_id: &str) {
        self.groups.write().remove(user_id);
    }

    pub fn rebuild_requests(&self) -> Vec<String> {
        self.rebuilds.lock().clone()
    }
}

impl MembershipCache for MemoryMembership {
    fn groups_of<'a>(&'a self, user_id: &'a str) -> CollabFuture<'a, Option<Vec<String>>> {
        let groups = self.groups.read().get(user_id).cloned();
        Box::pin(std::future::ready(Ok(groups)))
    }

    fn request_rebuild<'a>(&'a self, user_id: &'a str) -> CollabFuture<'a, ()> {
        self.rebuilds.lock().push(user_id.to_string());
        Box::pin(std::future::ready(Ok(())))
    }
}
