use std::collections::BTreeSet;
use std::num::NonZeroU16;

use dashmap::DashMap;

use tinymq_net::MqttError;

use crate::types::{ClientId, PacketId};

/// Per-client packet identifier tables.
///
/// Each client has its own set of ids in use; [`request`](Self::request) hands out the lowest free
/// id. The map shard lock serializes concurrent requests for the same client.
#[derive(Default)]
pub struct PacketIdAllocator {
    ids: DashMap<ClientId, BTreeSet<PacketId>, ahash::RandomState>,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, client_id: &ClientId) -> Result<PacketId, MqttError> {
        let mut used = self.ids.entry(client_id.clone()).or_default();
        let mut candidate: u32 = 1;
        match used.last() {
            //ids 1..=len are all taken
            Some(last) if usize::from(last.get()) == used.len() => candidate = u32::from(last.get()) + 1,
            _ => {
                for id in used.iter() {
                    if u32::from(id.get()) != candidate {
                        break;
                    }
                    candidate += 1;
                }
            }
        }
        let id = u16::try_from(candidate).ok().and_then(NonZeroU16::new).ok_or(MqttError::PacketIdExhausted)?;
        used.insert(id);
        Ok(id)
    }

    /// Marks `id` as in use, returning false if it already was.
    pub fn reserve(&self, client_id: &ClientId, id: PacketId) -> bool {
        self.ids.entry(client_id.clone()).or_default().insert(id)
    }

    pub fn free(&self, client_id: &ClientId, id: PacketId) -> bool {
        let removed = match self.ids.get_mut(client_id) {
            Some(mut used) => used.remove(&id),
            None => return false,
        };
        self.ids.remove_if(client_id, |_, used| used.is_empty());
        removed
    }

    pub fn clean(&self, client_id: &ClientId) {
        self.ids.remove(client_id);
    }

    pub fn in_use(&self, client_id: &ClientId) -> usize {
        self.ids.get(client_id).map(|used| used.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use nonzero_ext::nonzero;

    use super::*;

    #[test]
    fn test_lowest_free() {
        let alloc = PacketIdAllocator::new();
        let c1: ClientId = "c1".into();
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(1u16));
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(2u16));
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(3u16));

        assert!(alloc.free(&c1, nonzero!(2u16)));
        assert!(!alloc.free(&c1, nonzero!(2u16)));
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(2u16));
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(4u16));

        //tables are per client
        assert_eq!(alloc.request(&"c2".into()).unwrap(), nonzero!(1u16));
    }

    #[test]
    fn test_reserve_and_clean() {
        let alloc = PacketIdAllocator::new();
        let c1: ClientId = "c1".into();
        assert!(alloc.reserve(&c1, nonzero!(1u16)));
        assert!(!alloc.reserve(&c1, nonzero!(1u16)));
        assert!(alloc.reserve(&c1, nonzero!(3u16)));
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(2u16));
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(4u16));
        assert_eq!(alloc.in_use(&c1), 4);

        alloc.clean(&c1);
        assert_eq!(alloc.in_use(&c1), 0);
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(1u16));
    }

    #[test]
    fn test_exhausted() {
        let alloc = PacketIdAllocator::new();
        let c1: ClientId = "c1".into();
        for _ in 0..u16::MAX {
            alloc.request(&c1).unwrap();
        }
        assert!(matches!(alloc.request(&c1), Err(MqttError::PacketIdExhausted)));
        assert!(alloc.free(&c1, nonzero!(777u16)));
        assert_eq!(alloc.request(&c1).unwrap(), nonzero!(777u16));
    }

    #[test]
    fn test_never_reissues_in_use() {
        let alloc = PacketIdAllocator::new();
        let c1: ClientId = "c1".into();
        let mut issued = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(issued.insert(alloc.request(&c1).unwrap()));
        }
        for id in (1..=100u16).step_by(3).filter_map(NonZeroU16::new) {
            assert!(alloc.free(&c1, id));
            issued.remove(&id);
        }
        for _ in 0..50 {
            assert!(issued.insert(alloc.request(&c1).unwrap()));
        }
    }
}
