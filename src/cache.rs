use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, trace};

use crate::db::{self, now_timestamp};
use crate::errors::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::geocoder::ServiceId;

/// Outcome of a cache probe. `Hit(None)` is a cached tombstone: the service
/// is already known to fail on this address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheLookup {
    Hit(Option<GeoPoint>),
    Miss,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total: u64,
    pub hit_rate: f64,
    pub size: usize,
}

/// Durable coordinate cache shared by every worker of a run.
///
/// Reads and writes go through one connection behind a mutex, so the
/// sqlite store only ever sees serialized access.
pub struct GeocodingCache {
    db: Arc<Mutex<Connection>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GeocodingCache {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let ctx = db::bootstrap(path)?;
        Ok(Self::from_connection(ctx.connection))
    }

    pub fn in_memory() -> AppResult<Self> {
        let ctx = db::bootstrap_in_memory()?;
        Ok(Self::from_connection(ctx.connection))
    }

    fn from_connection(connection: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(connection)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(
        &self,
        address: &str,
        service: ServiceId,
        region: Option<&str>,
    ) -> AppResult<CacheLookup> {
        let key = cache_key(address, service, region);
        let row: Option<(Option<f64>, Option<f64>)> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT lat, lng FROM geocoding_cache WHERE cache_key = ?1",
                [&key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        match row {
            Some((lat, lng)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let point = match (lat, lng) {
                    (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
                    _ => None,
                };
                trace!(target: "geocoding_cache", %service, address, tombstone = point.is_none(), "hit");
                Ok(CacheLookup::Hit(point))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(CacheLookup::Miss)
            }
        }
    }

    pub fn set(
        &self,
        address: &str,
        service: ServiceId,
        coords: Option<GeoPoint>,
        region: Option<&str>,
    ) -> AppResult<()> {
        let key = cache_key(address, service, region);
        let region = normalized_region(region);
        {
            let conn = self.db.lock();
            conn.execute(
                "INSERT INTO geocoding_cache (cache_key, address, service, region, lat, lng, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(cache_key) DO UPDATE SET
                    lat = excluded.lat,
                    lng = excluded.lng,
                    created_at = excluded.created_at",
                (
                    key.as_str(),
                    address,
                    service.as_str(),
                    region.as_deref(),
                    coords.map(|p| p.latitude),
                    coords.map(|p| p.longitude),
                    now_timestamp(),
                ),
            )?;
        }
        trace!(target: "geocoding_cache", %service, address, tombstone = coords.is_none(), "stored");
        Ok(())
    }

    pub fn size(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        conn.query_row("SELECT COUNT(*) FROM geocoding_cache", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|value| value as usize)
        .map_err(AppError::from)
    }

    pub fn stats(&self) -> AppResult<CacheStats> {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Ok(CacheStats {
            hits,
            misses,
            total,
            hit_rate,
            size: self.size()?,
        })
    }

    pub fn clear(&self) -> AppResult<()> {
        let removed = {
            let conn = self.db.lock();
            conn.execute("DELETE FROM geocoding_cache", [])?
        };
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        info!(target: "geocoding_cache", removed, "cache cleared");
        Ok(())
    }
}

/// 128-bit digest of service, folded address and folded region.
pub fn cache_key(address: &str, service: ServiceId, region: Option<&str>) -> String {
    let mut material = format!("{}:{}", service.as_str(), fold(address));
    if let Some(region) = normalized_region(region) {
        material.push('|');
        material.push_str(&region);
    }
    format!("{:x}", md5::compute(material.as_bytes()))
}

fn fold(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalized_region(region: Option<&str>) -> Option<String> {
    region.map(fold).filter(|r| !r.is_empty())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tempfile::tempdir;

    use super::*;

    const LILLE: GeoPoint = GeoPoint {
        latitude: 50.6292,
        longitude: 3.0573,
    };

    #[test]
    fn round_trips_points_and_tombstones() {
        let cache = GeocodingCache::in_memory().unwrap();
        assert_eq!(
            cache.get("LILLE", ServiceId::Nominatim, None).unwrap(),
            CacheLookup::Miss
        );

        cache.set("LILLE", ServiceId::Nominatim, Some(LILLE), None).unwrap();
        cache.set("NOWHERE", ServiceId::Nominatim, None, None).unwrap();

        assert_eq!(
            cache.get("LILLE", ServiceId::Nominatim, None).unwrap(),
            CacheLookup::Hit(Some(LILLE))
        );
        assert_eq!(
            cache.get("NOWHERE", ServiceId::Nominatim, None).unwrap(),
            CacheLookup::Hit(None)
        );
    }

    #[test]
    fn keys_ignore_case_and_whitespace() {
        assert_eq!(
            cache_key("  Saint-Omer ", ServiceId::Nominatim, Some("Pas de  Calais")),
            cache_key("SAINT-OMER", ServiceId::Nominatim, Some("pas de calais"))
        );
        assert_eq!(cache_key("LILLE", ServiceId::Nominatim, None).len(), 32);
        assert_eq!(
            cache_key("LILLE", ServiceId::Nominatim, Some(" ")),
            cache_key("LILLE", ServiceId::Nominatim, None)
        );
    }

    #[test]
    fn separates_services_and_regions() {
        let cache = GeocodingCache::in_memory().unwrap();
        cache.set("LILLE", ServiceId::Nominatim, Some(LILLE), None).unwrap();

        assert_eq!(
            cache.get("LILLE", ServiceId::OpenRouteService, None).unwrap(),
            CacheLookup::Miss
        );
        assert_eq!(
            cache.get("LILLE", ServiceId::Nominatim, Some("Nord")).unwrap(),
            CacheLookup::Miss
        );
    }

    #[test]
    fn overwrite_is_idempotent() {
        let cache = GeocodingCache::in_memory().unwrap();
        cache.set("LILLE", ServiceId::Nominatim, None, None).unwrap();
        cache.set("lille", ServiceId::Nominatim, Some(LILLE), None).unwrap();
        cache.set("LILLE ", ServiceId::Nominatim, Some(LILLE), None).unwrap();

        assert_eq!(cache.size().unwrap(), 1);
        assert_eq!(
            cache.get("Lille", ServiceId::Nominatim, None).unwrap(),
            CacheLookup::Hit(Some(LILLE))
        );
    }

    #[test]
    fn tracks_hit_rate_and_resets_on_clear() {
        let cache = GeocodingCache::in_memory().unwrap();
        cache.set("LILLE", ServiceId::Nominatim, Some(LILLE), None).unwrap();
        cache.get("LILLE", ServiceId::Nominatim, None).unwrap();
        cache.get("LILLE", ServiceId::Nominatim, None).unwrap();
        cache.get("LYON", ServiceId::Nominatim, None).unwrap();
        cache.get("NICE", ServiceId::Nominatim, None).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.total, 4);
        assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.size, 1);

        cache.clear().unwrap();
        let cleared = cache.stats().unwrap();
        assert_eq!(cleared.hits, 0);
        assert_eq!(cleared.misses, 0);
        assert_eq!(cleared.size, 0);
        assert_eq!(cleared.hit_rate, 0.0);
    }

    #[test]
    fn persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = GeocodingCache::open(&path).unwrap();
            cache
                .set("LILLE", ServiceId::OpenRouteService, Some(LILLE), Some("Nord"))
                .unwrap();
            cache.set("ATLANTIS", ServiceId::OpenRouteService, None, None).unwrap();
        }

        let reopened = GeocodingCache::open(&path).unwrap();
        assert_eq!(
            reopened
                .get("lille", ServiceId::OpenRouteService, Some("NORD"))
                .unwrap(),
            CacheLookup::Hit(Some(LILLE))
        );
        assert_eq!(
            reopened
                .get("ATLANTIS", ServiceId::OpenRouteService, None)
                .unwrap(),
            CacheLookup::Hit(None)
        );
        assert_eq!(reopened.stats().unwrap().hits, 2);
    }

    #[test]
    fn tolerates_concurrent_writers() {
        let cache = Arc::new(GeocodingCache::in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..25 {
                        let address = format!("COMMUNE-{}", i % 10);
                        let point = GeoPoint::new(45.0 + i as f64 / 100.0, 2.0 + worker as f64 / 100.0);
                        cache
                            .set(&address, ServiceId::Nominatim, Some(point), None)
                            .unwrap();
                        cache.get(&address, ServiceId::Nominatim, None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.size().unwrap(), 10);
        assert_eq!(cache.stats().unwrap().hits, 200);
    }
}
