// src/slab.rs
use std::fmt;

/// Stable handle to a registry slot. The generation changes every time the
/// slot is recycled, so a handle held by a late timer callback or worker task
/// cannot resolve to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    /// Encode as a 64-bit multiplexer token.
    #[inline]
    pub fn token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
    next_free: Option<u32>,
}

/// Fixed-capacity slab with an intrusive free list. Slots are created lazily
/// up to `capacity` and reused LIFO afterwards.
pub struct ConnectionSlab<T> {
    entries: Vec<Slot<T>>,
    head_free: Option<u32>,
    active_count: usize,
    capacity: usize,
}

impl<T> ConnectionSlab<T> {
    pub fn new(capacity: usize) -> Self {
        // The two highest indices stay free for the reactor's own tokens.
        let capacity = capacity.min(u32::MAX as usize - 1);
        Self {
            entries: Vec::with_capacity(capacity.min(1024)),
            head_free: None,
            active_count: 0,
            capacity,
        }
    }

    /// O(1) allocation. Returns `None` when every slot is occupied.
    pub fn allocate(&mut self, value: T) -> Option<ConnId> {
        let index = match self.head_free {
            Some(idx) => {
                let slot = &mut self.entries[idx as usize];
                self.head_free = slot.next_free.take();
                slot.value = Some(value);
                idx
            }
            None => {
                if self.entries.len() >= self.capacity {
                    return None;
                }
                self.entries.push(Slot {
                    generation: 0,
                    value: Some(value),
                    next_free: None,
                });
                (self.entries.len() - 1) as u32
            }
        };

        self.active_count += 1;
        Some(ConnId {
            index,
            generation: self.entries[index as usize].generation,
        })
    }

    /// O(1) deallocation. A stale or already freed handle is ignored.
    pub fn free(&mut self, id: ConnId) -> Option<T> {
        let slot = self.entries.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.value.is_none() {
            return None;
        }

        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.head_free;
        self.head_free = Some(id.index);
        self.active_count -= 1;
        value
    }

    #[inline]
    pub fn get(&self, id: ConnId) -> Option<&T> {
        let slot = self.entries.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        let slot = self.entries.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Every live entry with its handle.
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    ConnId {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_operations() {
        let mut slab = ConnectionSlab::new(10);

        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 10);

        let id1 = slab.allocate(100).unwrap();
        assert_eq!(id1.index(), 0);
        assert_eq!(slab.get(id1), Some(&100));

        let id2 = slab.allocate(101).unwrap();
        assert_eq!(id2.index(), 1);

        assert_eq!(slab.free(id1), Some(100));
        assert_eq!(slab.len(), 1);

        // Index 0 is reused from the head of the free list with a new generation.
        let id3 = slab.allocate(102).unwrap();
        assert_eq!(id3.index(), 0);
        assert_ne!(id3, id1);
        assert_eq!(slab.get(id1), None);
        assert_eq!(slab.get(id3), Some(&102));
    }

    #[test]
    fn test_stale_handle_cannot_free_new_owner() {
        let mut slab = ConnectionSlab::new(1);
        let old = slab.allocate("old").unwrap();
        slab.free(old);
        let new = slab.allocate("new").unwrap();

        assert_eq!(slab.free(old), None);
        assert_eq!(slab.get(new), Some(&"new"));
        assert_eq!(slab.free(new), Some("new"));
        assert_eq!(slab.free(new), None);
    }

    #[test]
    fn test_capacity_limit() {
        let mut slab = ConnectionSlab::new(2);
        let a = slab.allocate(1).unwrap();
        slab.allocate(2).unwrap();
        assert!(slab.allocate(3).is_none());
        slab.free(a);
        assert!(slab.allocate(3).is_some());
        assert_eq!(slab.iter().count(), 2);
    }

    #[test]
    fn test_token_round_trip() {
        let mut slab = ConnectionSlab::new(4);
        let id = slab.allocate(()).unwrap();
        slab.free(id);
        let id = slab.allocate(()).unwrap();
        assert_eq!(ConnId::from_token(id.token()), id);
        assert_eq!(id.token() >> 32, 1);
    }
}
