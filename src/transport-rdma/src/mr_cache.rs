//! Reuse of provider-allocated registrations, keyed by size.
use fnv::FnvHashMap;

use rdma::ibv::{AccessFlags, ProtectionDomain};
use rdma::mr::MemoryRegion;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MrCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub registrations: u64,
}

/// One registration per distinct size, created on first use and dropped with the cache.
pub struct MrCache<'pd, 'ctx> {
    pd: &'pd ProtectionDomain<'ctx>,
    access: AccessFlags,
    regions: FnvHashMap<usize, MemoryRegion<'pd>>,
    stats: MrCacheStats,
}

impl<'pd, 'ctx> MrCache<'pd, 'ctx> {
    pub fn new(pd: &'pd ProtectionDomain<'ctx>, access: AccessFlags) -> Self {
        MrCache {
            pd,
            access,
            regions: FnvHashMap::default(),
            stats: MrCacheStats::default(),
        }
    }

    /// A registration of exactly `size` bytes. Its content is whatever the previous user left.
    pub fn get(&mut self, size: usize) -> Result<&mut MemoryRegion<'pd>> {
        use std::collections::hash_map::Entry;
        match self.regions.entry(size) {
            Entry::Occupied(e) => {
                self.stats.hits += 1;
                Ok(e.into_mut())
            }
            Entry::Vacant(e) => {
                self.stats.misses += 1;
                let mr = self
                    .pd
                    .alloc_mr(size, self.access)
                    .map_err(|source| Error::Provisioning {
                        resource: "cached memory region",
                        source,
                    })?;
                self.stats.registrations += 1;
                tracing::debug!("mr cache: registered {} bytes at {:#x}", size, mr.addr());
                Ok(e.insert(mr))
            }
        }
    }

    #[inline]
    pub fn stats(&self) -> MrCacheStats {
        self.stats
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl<'pd, 'ctx> Drop for MrCache<'pd, 'ctx> {
    fn drop(&mut self) {
        tracing::debug!(
            "mr cache: {} hits, {} misses, releasing {} registrations",
            self.stats.hits,
            self.stats.misses,
            self.regions.len()
        );
        for (_, mut mr) in self.regions.drain() {
            if let Err(e) = mr.release() {
                tracing::warn!("mr cache: failed to deregister {}: {}", mr.handle(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use rdma::ibv::{Context, Verbs};
    use rdma::soft::SoftFabric;

    #[test]
    fn test_hits_and_misses() {
        let fabric = SoftFabric::default();
        let verbs: Arc<dyn Verbs> = Arc::new(fabric.clone());
        let dev = verbs.get_devices().unwrap().remove(0);
        let ctx = Context::open(Arc::clone(&verbs), &dev).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        {
            let mut cache = MrCache::new(&pd, AccessFlags::remote_rw());
            let addr = cache.get(4096).unwrap().addr();
            cache.get(4096).unwrap()[..2].copy_from_slice(b"hi");
            assert_eq!(cache.get(4096).unwrap().addr(), addr);
            assert_eq!(&cache.get(4096).unwrap()[..2], b"hi");
            cache.get(8192).unwrap();
            assert_eq!(
                cache.stats(),
                MrCacheStats {
                    hits: 3,
                    misses: 2,
                    registrations: 2,
                }
            );
            assert_eq!(cache.len(), 2);
            assert_eq!(fabric.live_mrs(), 2);
        }
        assert_eq!(fabric.live_mrs(), 0);
    }

    #[test]
    fn test_failed_registration_is_not_cached() {
        let fabric = SoftFabric::default();
        let verbs: Arc<dyn Verbs> = Arc::new(fabric);
        let dev = verbs.get_devices().unwrap().remove(0);
        let ctx = Context::open(Arc::clone(&verbs), &dev).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let mut cache = MrCache::new(&pd, AccessFlags::remote_rw());
        assert!(matches!(cache.get(0), Err(Error::Provisioning { .. })));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().registrations, 0);
    }
}
