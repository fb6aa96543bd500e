use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::GeoPoint;

const COUNTRY_SUFFIX: &str = "France";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceId {
    #[serde(rename = "nominatim")]
    Nominatim,
    #[serde(rename = "ors")]
    OpenRouteService,
}

impl ServiceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Nominatim => "nominatim",
            ServiceId::OpenRouteService => "ors",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nominatim" => Ok(ServiceId::Nominatim),
            "ors" | "openrouteservice" => Ok(ServiceId::OpenRouteService),
            _ => Err(AppError::Config(format!("unknown geocoding service: {value}"))),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns a commune name (plus optional region) into coordinates.
///
/// `Ok(None)` means the service answered but found nothing; transport and
/// protocol problems are `Err`.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str, region: Option<&str>) -> AppResult<Option<GeoPoint>>;
}

/// Enforces a minimum interval between consecutive calls, shared by every
/// worker holding the same limiter.
pub struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// A configured geocoding provider as seen by the resolver.
#[derive(Clone)]
pub struct GeocodingService {
    id: ServiceId,
    geocoder: Arc<dyn Geocoder>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl GeocodingService {
    pub fn new(id: ServiceId, geocoder: Arc<dyn Geocoder>) -> Self {
        Self {
            id,
            geocoder,
            rate_limiter: None,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.rate_limiter = if min_interval.is_zero() {
            None
        } else {
            Some(Arc::new(RateLimiter::new(min_interval)))
        };
        self
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Calls the underlying geocoder, honouring the rate limit first.
    pub async fn geocode(&self, query: &str, region: Option<&str>) -> AppResult<Option<GeoPoint>> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.wait().await;
        }
        let point = self.geocoder.geocode(query, region).await?;
        Ok(point.filter(GeoPoint::is_valid))
    }
}

/// Primary service always, secondary only when an API key is configured.
pub fn services_from_config(config: &AppConfig) -> AppResult<Vec<GeocodingService>> {
    let nominatim = NominatimGeocoder::new(
        &config.nominatim_base_url,
        &config.nominatim_user_agent,
        config.geocoder_timeout(),
    )?;
    let mut services = vec![GeocodingService::new(ServiceId::Nominatim, Arc::new(nominatim))
        .with_min_interval(config.nominatim_min_interval())];

    match config.ors_api_key.clone() {
        Some(key) => {
            let ors = OrsGeocoder::new(&config.ors_base_url, key, config.geocoder_timeout())?;
            services.push(GeocodingService::new(ServiceId::OpenRouteService, Arc::new(ors)));
        }
        None => debug!(
            target: "geocoder",
            "no OpenRouteService key configured; running with Nominatim only"
        ),
    }
    Ok(services)
}

fn http_client(user_agent: &str, timeout: Duration) -> AppResult<Client> {
    Ok(Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()?)
}

fn search_text(commune: &str, region: Option<&str>) -> String {
    match region.map(str::trim).filter(|r| !r.is_empty()) {
        Some(region) => format!("{commune}, {region}, {COUNTRY_SUFFIX}"),
        None => format!("{commune}, {COUNTRY_SUFFIX}"),
    }
}

pub struct NominatimGeocoder {
    http: Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(user_agent, timeout)?,
            base_url: base_url.to_string(),
        })
    }

    async fn search(&self, text: &str) -> AppResult<Option<GeoPoint>> {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: String,
            lon: String,
        }

        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("q", text),
                ("format", "jsonv2"),
                ("countrycodes", "fr"),
                ("limit", "1"),
            ])
            .send()
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited(ServiceId::Nominatim));
        }
        let hits: Vec<SearchHit> = response.error_for_status()?.json().await?;
        let Some(first) = hits.into_iter().next() else {
            return Ok(None);
        };

        let latitude = parse_coordinate(ServiceId::Nominatim, "lat", &first.lat)?;
        let longitude = parse_coordinate(ServiceId::Nominatim, "lon", &first.lon)?;
        trace!(target: "geocoder", service = "nominatim", query = text, latitude, longitude, "hit");
        Ok(Some(GeoPoint::new(latitude, longitude)))
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str, region: Option<&str>) -> AppResult<Option<GeoPoint>> {
        if region.map(str::trim).is_some_and(|r| !r.is_empty()) {
            if let Some(point) = self.search(&search_text(query, region)).await? {
                return Ok(Some(point));
            }
        }
        self.search(&search_text(query, None)).await
    }
}

fn parse_coordinate(service: ServiceId, field: &str, value: &str) -> AppResult<f64> {
    value.trim().parse::<f64>().map_err(|_| AppError::Geocode {
        service,
        message: format!("invalid {field} in response: {value:?}"),
    })
}

pub struct OrsGeocoder {
    http: Client,
    search_url: String,
    api_key: SecretString,
}

impl OrsGeocoder {
    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let user_agent = format!("dual-distance/{}", env!("CARGO_PKG_VERSION"));
        Ok(Self {
            http: http_client(&user_agent, timeout)?,
            search_url: format!("{}/geocode/search", base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

#[async_trait]
impl Geocoder for OrsGeocoder {
    async fn geocode(&self, query: &str, region: Option<&str>) -> AppResult<Option<GeoPoint>> {
        #[derive(Deserialize)]
        struct FeatureCollection {
            #[serde(default)]
            features: Vec<Feature>,
        }

        #[derive(Deserialize)]
        struct Feature {
            geometry: Geometry,
        }

        #[derive(Deserialize)]
        struct Geometry {
            coordinates: Vec<f64>,
        }

        let text = search_text(query, region);
        let response = self
            .http
            .get(&self.search_url)
            .query(&[
                ("api_key", self.api_key.expose_secret()),
                ("text", text.as_str()),
                ("boundary.country", "FR"),
                ("size", "1"),
            ])
            .send()
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited(ServiceId::OpenRouteService));
        }
        let parsed: FeatureCollection = response.error_for_status()?.json().await?;
        let Some(feature) = parsed.features.into_iter().next() else {
            return Ok(None);
        };

        match feature.geometry.coordinates.as_slice() {
            [longitude, latitude, ..] => {
                trace!(target: "geocoder", service = "ors", query = %text, latitude, longitude, "hit");
                Ok(Some(GeoPoint::new(*latitude, *longitude)))
            }
            _ => Err(AppError::Geocode {
                service: ServiceId::OpenRouteService,
                message: "feature geometry missing coordinates".into(),
            }),
        }
    }
}
