use std::{future::Future, ops::Range, sync::Mutex};

use hashbrown::{hash_map::Entry as MapEntry, HashMap};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use super::{lock, Object};
use crate::{
    error::Error,
    id::{GlobalId, NodeId},
};

enum Entry {
    Pending(Vec<oneshot::Sender<Object>>),
    Ready(Object),
}

/// What a lookup found.
pub enum Lookup {
    Ready(Object),
    /// Someone else is fetching it; wait for their result.
    Wait(oneshot::Receiver<Object>),
    /// This caller inserted the pending marker and must fetch it, then call
    /// [`Cache::complete`].
    Fetch,
}

/// Objects owned by other nodes, bucketed by owner, plus the id ranges this
/// node has reserved on each of them.
pub struct Cache {
    node_count: u32,
    nodes: Vec<Mutex<HashMap<GlobalId, Entry>>>,
    reserved: Vec<AsyncMutex<Range<u32>>>,
}

impl Cache {
    pub fn new(node_count: u32) -> Self {
        Self {
            node_count,
            nodes: (0..node_count).map(|_| Mutex::new(HashMap::new())).collect(),
            reserved: (0..node_count).map(|_| AsyncMutex::new(0..0)).collect(),
        }
    }

    fn bucket(&self, id: GlobalId) -> &Mutex<HashMap<GlobalId, Entry>> {
        &self.nodes[id.owner(self.node_count) as usize]
    }

    /// Looks `id` up, atomically marking it pending when absent so that at
    /// most one fetch per id is ever outstanding.
    pub fn lookup(&self, id: GlobalId) -> Lookup {
        let mut objects = lock(self.bucket(id));
        match objects.entry(id) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::Pending(Vec::new()));
                Lookup::Fetch
            }
            MapEntry::Occupied(mut occupied) => match occupied.get_mut() {
                Entry::Ready(object) => Lookup::Ready(object.clone()),
                Entry::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Lookup::Wait(rx)
                }
            },
        }
    }

    /// Resolves a pending entry and wakes everyone waiting on it.
    pub fn complete(&self, id: GlobalId, object: Object) {
        let waiters = {
            let mut objects = lock(self.bucket(id));
            match objects.insert(id, Entry::Ready(object.clone())) {
                Some(Entry::Pending(waiters)) => waiters,
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(object.clone());
        }
    }

    /// Stores a pushed object unless one is already resolved. Reports
    /// whether it was stored.
    pub fn insert(&self, id: GlobalId, object: Object) -> bool {
        if matches!(lock(self.bucket(id)).get(&id), Some(Entry::Ready(_))) {
            return false;
        }
        self.complete(id, object);
        true
    }

    pub fn get(&self, id: GlobalId) -> Option<Object> {
        match lock(self.bucket(id)).get(&id) {
            Some(Entry::Ready(object)) => Some(object.clone()),
            _ => None,
        }
    }

    /// Every resolved entry.
    pub fn entries(&self) -> Vec<(GlobalId, Object)> {
        self.nodes
            .iter()
            .flat_map(|bucket| {
                lock(bucket)
                    .iter()
                    .filter_map(|(id, entry)| match entry {
                        Entry::Ready(object) => Some((*id, object.clone())),
                        Entry::Pending(_) => None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Replaces every entry. Pending fetches are dropped with them, and so
    /// are reserved ranges, which the restored owners may hand out again.
    pub fn restore(&self, entries: Vec<(GlobalId, Object)>) {
        for bucket in &self.nodes {
            lock(bucket).clear();
        }
        for range in &self.reserved {
            // a refill in flight keeps the range it gets
            if let Ok(mut range) = range.try_lock() {
                *range = 0..0;
            }
        }
        for (id, object) in entries {
            lock(self.bucket(id)).insert(id, Entry::Ready(object));
        }
    }

    /// Hands out the next id reserved on `node`, calling `refill` for a new
    /// range when the current one is used up.
    pub async fn reserve_id<F, Fut>(
        &self,
        node: NodeId,
        refill: F,
    ) -> Result<GlobalId, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Range<u32>, Error>>,
    {
        let mut range = self.reserved[node as usize].lock().await;
        if range.is_empty() {
            *range = refill().await?;
        }
        let slot = range.start;
        range.start += 1;
        Ok(GlobalId::direct(node, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ObjectKind;

    #[test]
    fn test_single_outstanding_fetch() {
        let cache = Cache::new(2);
        let id = GlobalId::direct(1, 9);
        assert!(matches!(cache.lookup(id), Lookup::Fetch));
        let mut first = match cache.lookup(id) {
            Lookup::Wait(rx) => rx,
            _ => panic!("second lookup must wait"),
        };
        let mut second = match cache.lookup(id) {
            Lookup::Wait(rx) => rx,
            _ => panic!("third lookup must wait"),
        };
        cache.complete(id, Object::Proxy(ObjectKind::Event));
        assert_eq!(first.try_recv().unwrap().kind(), ObjectKind::Event);
        assert_eq!(second.try_recv().unwrap().kind(), ObjectKind::Event);
        assert!(matches!(cache.lookup(id), Lookup::Ready(_)));
    }

    #[test]
    fn test_insert_keeps_resolved_object() {
        let cache = Cache::new(2);
        let id = GlobalId::direct(0, 4);
        assert!(cache.insert(id, Object::Proxy(ObjectKind::Task)));
        assert!(!cache.insert(id, Object::Proxy(ObjectKind::Event)));
        assert_eq!(cache.get(id).map(|o| o.kind()), Some(ObjectKind::Task));
        assert_eq!(cache.entries().len(), 1);

        cache.restore(vec![(GlobalId::direct(1, 2), Object::Proxy(ObjectKind::Block))]);
        assert!(cache.get(id).is_none());
        assert_eq!(cache.get(GlobalId::direct(1, 2)).map(|o| o.kind()), Some(ObjectKind::Block));
    }

    #[tokio::test]
    async fn test_reserve_id_refills_once_per_range() {
        let cache = Cache::new(2);
        let refills = std::sync::atomic::AtomicUsize::new(0);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = cache
                .reserve_id(1, || async {
                    refills.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, Error>(10..13)
                })
                .await
                .unwrap();
            assert_eq!(id.owner(2), 1);
            ids.push(id.index());
        }
        assert_eq!(refills.into_inner(), 2);
        assert_eq!(ids, vec![10, 11, 12, 10, 11]);
    }
}
