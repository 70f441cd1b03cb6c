use maxminddb::{Reader, geoip2};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::sanitize_display;
use crate::error::{MtrError, MtrResult};
use crate::state::GeoLocation;

/// Source of geographic information for responder addresses.
///
/// Lookups never fail: an unknown address is simply `None`.
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, addr: IpAddr) -> Option<GeoLocation>;

    /// Short name of the backend ("maxmind", "none", ...)
    fn source(&self) -> &str;

    /// Release backend resources. Later lookups return `None`.
    fn close(&self);
}

/// Resolver that knows nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

impl GeoResolver for NoopResolver {
    fn resolve(&self, _addr: IpAddr) -> Option<GeoLocation> {
        None
    }

    fn source(&self) -> &str {
        "none"
    }

    fn close(&self) {}
}

/// GeoIP cache entry
struct CacheEntry {
    geo: Option<GeoLocation>,
    cached_at: Instant,
}

/// GeoIP lookup using a MaxMind GeoLite2-City database
pub struct MaxMindResolver {
    reader: RwLock<Option<Reader<Vec<u8>>>>,
    cache: RwLock<HashMap<IpAddr, CacheEntry>>,
    cache_ttl: Duration,
}

const DB_FILE: &str = "GeoLite2-City.mmdb";

impl MaxMindResolver {
    pub const SOURCE: &'static str = "maxmind";

    /// Open a database file
    pub fn open<P: AsRef<Path>>(db_path: P) -> MtrResult<Self> {
        let path = db_path.as_ref();
        let reader = Reader::open_readfile(path).map_err(|e| MtrError::GeoDatabase {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "opened GeoIP database");

        Ok(Self {
            reader: RwLock::new(Some(reader)),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(3600), // 1 hour
        })
    }

    /// Paths searched when no database is given, in order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::data_dir().map(|d| d.join("hopwatch").join(DB_FILE)),
            dirs::config_dir().map(|d| d.join("hopwatch").join(DB_FILE)),
            Some(PathBuf::from(DB_FILE)),
            Some(PathBuf::from("/usr/share/GeoIP").join(DB_FILE)),
            Some(PathBuf::from("/var/lib/GeoIP").join(DB_FILE)),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Open the first readable database among [`MaxMindResolver::default_paths`]
    pub fn try_default() -> Option<Self> {
        Self::default_paths()
            .into_iter()
            .filter(|path| path.exists())
            .find_map(|path| match Self::open(&path) {
                Ok(resolver) => Some(resolver),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable GeoIP database");
                    None
                }
            })
    }

    fn do_lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        let reader = self.reader.read();
        let city: geoip2::City = reader.as_ref()?.lookup(ip).ok()?;

        let country = city.country.as_ref().and_then(|c| {
            c.names
                .as_ref()
                .and_then(|n| n.get("en").copied())
                .or(c.iso_code)
        });

        let city_name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en").copied());

        let province = city
            .subdivisions
            .as_ref()
            .and_then(|s| s.first())
            .and_then(|s| s.names.as_ref())
            .and_then(|n| n.get("en").copied());

        if country.is_none() && city_name.is_none() && province.is_none() {
            return None;
        }

        Some(GeoLocation {
            country: country.map(sanitize_display),
            province: province.map(sanitize_display),
            city: city_name.map(sanitize_display),
            isp: None,
            source: Some(Self::SOURCE.to_string()),
            raw: None,
        })
    }
}

impl GeoResolver for MaxMindResolver {
    fn resolve(&self, addr: IpAddr) -> Option<GeoLocation> {
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&addr)
                && entry.cached_at.elapsed() < self.cache_ttl
            {
                return entry.geo.clone();
            }
        }

        let geo = self.do_lookup(addr);

        self.cache.write().insert(
            addr,
            CacheEntry {
                geo: geo.clone(),
                cached_at: Instant::now(),
            },
        );

        geo
    }

    fn source(&self) -> &str {
        Self::SOURCE
    }

    fn close(&self) {
        self.reader.write().take();
        self.cache.write().clear();
    }
}

/// Build a geo resolver by name.
///
/// `""`, `none`, `noop` and `off` give [`NoopResolver`]; `maxmind` opens
/// `db_path`, or the first database found in the default locations.
pub fn new_geo_resolver(source: &str, db_path: Option<&Path>) -> MtrResult<Arc<dyn GeoResolver>> {
    match source.trim().to_ascii_lowercase().as_str() {
        "" | "none" | "noop" | "off" => Ok(Arc::new(NoopResolver)),
        "maxmind" => {
            let resolver = match db_path {
                Some(path) => MaxMindResolver::open(path)?,
                None => MaxMindResolver::try_default().ok_or_else(|| MtrError::GeoDatabase {
                    path: DB_FILE.to_string(),
                    reason: "not found in any default location (use --geoip-db)".to_string(),
                })?,
            };
            Ok(Arc::new(resolver))
        }
        other => Err(MtrError::UnknownGeoSource(other.to_string())),
    }
}
