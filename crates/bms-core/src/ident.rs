//! Numeric identifier allocation: uid-like offsets per bundle class.
//!
//! Three disjoint first-fit ranges (system, vendor-system, third-party) with
//! recycling. All three maps live behind one mutex owned by this type, so
//! allocation is atomic independently of any bundle lock.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use bms_domain::{AppType, InstallError, InstallResult, PackageRecord, BASE_USER_RANGE};

use crate::config::{IdRange, ServiceConfig};
use crate::storage::MetadataStore;

#[derive(Debug, Default)]
struct IdMaps {
    system: BTreeMap<u32, String>,
    third_system: BTreeMap<u32, String>,
    third_party: BTreeMap<u32, String>,
}

impl IdMaps {
    fn class(&mut self, app_type: AppType) -> &mut BTreeMap<u32, String> {
        match app_type {
            AppType::System => &mut self.system,
            AppType::ThirdPartySystem => &mut self.third_system,
            AppType::ThirdParty => &mut self.third_party,
        }
    }

    fn combined(&self) -> BTreeMap<u32, String> {
        let mut out = BTreeMap::new();
        for map in [&self.system, &self.third_system, &self.third_party] {
            for (offset, name) in map {
                out.insert(*offset, name.clone());
            }
        }
        out
    }
}

pub struct IdentifierAllocator {
    maps: Mutex<IdMaps>,
    ranges: [(AppType, IdRange); 3],
    store: MetadataStore,
}

impl IdentifierAllocator {
    /// Opens the allocator, loading any persisted map.
    ///
    /// # Errors
    /// Fails when the persisted identifier document cannot be read.
    pub fn open(config: &ServiceConfig, store: MetadataStore) -> InstallResult<Self> {
        let ranges = [
            (AppType::System, config.system_ids),
            (AppType::ThirdPartySystem, config.third_system_ids),
            (AppType::ThirdParty, config.third_party_ids),
        ];
        let mut maps = IdMaps::default();
        for (offset, name) in store.load_id_maps()? {
            if let Some((app_type, _)) = ranges.iter().find(|(_, r)| r.contains(offset)) {
                maps.class(*app_type).insert(offset, name);
            }
        }
        Ok(Self {
            maps: Mutex::new(maps),
            ranges,
            store,
        })
    }

    fn range(&self, app_type: AppType) -> IdRange {
        self.ranges
            .iter()
            .find(|(t, _)| *t == app_type)
            .map(|(_, r)| *r)
            .unwrap_or(self.ranges[2].1)
    }

    /// Returns the offset already held by `bundle_name`, or the smallest
    /// free offset in the class range.
    ///
    /// # Errors
    /// Fails with [`InstallError::IdExhausted`] when the range is full.
    pub fn generate(&self, bundle_name: &str, app_type: AppType) -> InstallResult<u32> {
        let range = self.range(app_type);
        let mut maps = self.maps.lock().expect("identifier maps poisoned");
        let class = maps.class(app_type);
        if let Some((offset, _)) = class.iter().find(|(_, name)| name.as_str() == bundle_name) {
            return Ok(*offset);
        }
        let mut candidate = range.base;
        for occupied in class.keys() {
            if *occupied == candidate {
                candidate += 1;
            } else if *occupied > candidate {
                break;
            }
        }
        if !range.contains(candidate) {
            return Err(InstallError::IdExhausted);
        }
        class.insert(candidate, bundle_name.to_owned());
        debug!(bundle = bundle_name, offset = candidate, "identifier allocated");
        self.store.save_id_maps(&maps.combined())?;
        Ok(candidate)
    }

    /// Releases the identifier held by `bundle_name`, if any.
    ///
    /// A bundle's class cannot change after creation, but all three maps are
    /// scanned defensively.
    pub fn recycle(&self, bundle_name: &str) -> InstallResult<()> {
        let mut maps = self.maps.lock().expect("identifier maps poisoned");
        let mut removed = false;
        // Reborrow once so the class maps can be borrowed disjointly.
        let inner = &mut *maps;
        for map in [&mut inner.system, &mut inner.third_system, &mut inner.third_party] {
            if let Some(offset) = map
                .iter()
                .find(|(_, name)| name.as_str() == bundle_name)
                .map(|(offset, _)| *offset)
            {
                map.remove(&offset);
                debug!(bundle = bundle_name, offset, "identifier recycled");
                removed = true;
                break;
            }
        }
        if removed {
            self.store.save_id_maps(&maps.combined())?;
        }
        Ok(())
    }

    /// Rebuilds the maps from loaded records at warm boot.
    pub fn restore(&self, records: &[PackageRecord]) -> InstallResult<()> {
        let mut maps = self.maps.lock().expect("identifier maps poisoned");
        for record in records {
            let Some(user) = record.users.values().next() else {
                continue;
            };
            let offset = user.uid - user.user_id * BASE_USER_RANGE;
            let Ok(offset) = u32::try_from(offset) else {
                continue;
            };
            if let Some((app_type, _)) = self.ranges.iter().find(|(_, r)| r.contains(offset)) {
                maps.class(*app_type)
                    .insert(offset, record.bundle_name.clone());
            }
        }
        self.store.save_id_maps(&maps.combined())
    }
}

/// uid handed to the filesystem layer for one user's instance of a bundle.
#[must_use]
pub fn uid_for(user_id: i32, offset: u32) -> i32 {
    user_id * BASE_USER_RANGE + i32::try_from(offset).unwrap_or(0)
}
