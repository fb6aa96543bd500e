use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheLookup, GeocodingCache};
use crate::errors::{AppError, AppResult};
use crate::geo::{candidate_distance_km, round2, GeoPoint};
use crate::geocoder::{GeocodingService, ServiceId};
use crate::normalize::{is_blank, normalize_commune_name};

/// Two nonzero candidates closer than this (in percent of the larger one)
/// are averaged; further apart, the smaller one wins with a warning.
pub const DISAGREEMENT_THRESHOLD_PERCENT: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressPair {
    pub origin: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_region: Option<String>,
}

impl AddressPair {
    pub fn new(origin: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            origin_region: None,
            destination_region: None,
        }
    }

    pub fn with_regions(mut self, origin_region: Option<String>, destination_region: Option<String>) -> Self {
        self.origin_region = origin_region.filter(|r| !is_blank(r));
        self.destination_region = destination_region.filter(|r| !is_blank(r));
        self
    }

    /// Either side is an empty spreadsheet cell.
    pub fn is_blank(&self) -> bool {
        is_blank(&self.origin) || is_blank(&self.destination)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceSource {
    Both,
    Nominatim,
    #[serde(rename = "ors")]
    OpenRouteService,
    Average,
    None,
}

impl DistanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceSource::Both => "both",
            DistanceSource::Nominatim => "nominatim",
            DistanceSource::OpenRouteService => "ors",
            DistanceSource::Average => "average",
            DistanceSource::None => "none",
        }
    }
}

impl From<ServiceId> for DistanceSource {
    fn from(service: ServiceId) -> Self {
        match service {
            ServiceId::Nominatim => DistanceSource::Nominatim,
            ServiceId::OpenRouteService => DistanceSource::OpenRouteService,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Ok,
    Warning,
    Error,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Ok => "ok",
            ResolutionStatus::Warning => "warning",
            ResolutionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceResult {
    pub final_distance: Option<f64>,
    pub distance_by_source: BTreeMap<ServiceId, Option<f64>>,
    pub source: DistanceSource,
    pub status: ResolutionStatus,
    pub message: String,
    #[serde(default)]
    pub discrepancy_percent: Option<f64>,
    pub pair: AddressPair,
}

impl DistanceResult {
    pub fn error(pair: AddressPair, message: impl Into<String>) -> Self {
        Self {
            final_distance: None,
            distance_by_source: BTreeMap::new(),
            source: DistanceSource::None,
            status: ResolutionStatus::Error,
            message: message.into(),
            discrepancy_percent: None,
            pair,
        }
    }

    pub fn invalid_address(pair: AddressPair) -> Self {
        Self::error(pair, "invalid address")
    }

    /// Placeholder for a row skipped because one of its cells is empty.
    pub fn missing_address(pair: AddressPair) -> Self {
        Self::error(pair, "missing address")
    }

    /// Placeholder for a valid row whose chunk has not been computed yet.
    pub fn pending(pair: AddressPair) -> Self {
        Self::error(pair, "not computed yet")
    }

    pub fn worker_failure(pair: AddressPair, detail: impl std::fmt::Display) -> Self {
        Self::error(pair, format!("worker failure: {detail}"))
    }

    pub fn candidate(&self, service: ServiceId) -> Option<f64> {
        self.distance_by_source.get(&service).copied().flatten()
    }
}

/// Outcome of combining zero, one or two candidate distances.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub final_distance: Option<f64>,
    pub source: DistanceSource,
    pub status: ResolutionStatus,
    pub message: String,
    pub discrepancy_percent: Option<f64>,
}

pub fn reconcile(candidates: &[(ServiceId, f64)]) -> Reconciliation {
    match candidates {
        [] => Reconciliation {
            final_distance: None,
            source: DistanceSource::None,
            status: ResolutionStatus::Error,
            message: "no distance computable (geocoding failed)".into(),
            discrepancy_percent: None,
        },
        [(service, distance)] => Reconciliation {
            final_distance: Some(*distance),
            source: (*service).into(),
            status: ResolutionStatus::Ok,
            message: format!("only {service} provided a distance"),
            discrepancy_percent: None,
        },
        [(first, a), (second, b), ..] => {
            let (a, b) = (*a, *b);
            if a == 0.0 && b == 0.0 {
                return Reconciliation {
                    final_distance: Some(0.0),
                    source: DistanceSource::Both,
                    status: ResolutionStatus::Ok,
                    message: "same place confirmed by both services".into(),
                    discrepancy_percent: None,
                };
            }
            if a == 0.0 || b == 0.0 {
                let (service, distance) = if a > 0.0 { (*first, a) } else { (*second, b) };
                return Reconciliation {
                    final_distance: Some(distance),
                    source: service.into(),
                    status: ResolutionStatus::Ok,
                    message: format!("zero distance on one service, using {service}"),
                    discrepancy_percent: None,
                };
            }

            let diff_percent = (a - b).abs() / a.max(b) * 100.0;
            if diff_percent < DISAGREEMENT_THRESHOLD_PERCENT {
                Reconciliation {
                    final_distance: Some(round2((a + b) / 2.0)),
                    source: DistanceSource::Average,
                    status: ResolutionStatus::Ok,
                    message: format!(
                        "difference below {DISAGREEMENT_THRESHOLD_PERCENT}%, average taken"
                    ),
                    discrepancy_percent: Some(round2(diff_percent)),
                }
            } else {
                let (service, distance) = if a < b { (*first, a) } else { (*second, b) };
                Reconciliation {
                    final_distance: Some(distance),
                    source: service.into(),
                    status: ResolutionStatus::Warning,
                    message: format!(
                        "large difference ({diff_percent:.1}%), smaller value taken ({service})"
                    ),
                    discrepancy_percent: Some(round2(diff_percent)),
                }
            }
        }
    }
}

/// Anything that can turn one address pair into a result. The batch layers
/// depend on this rather than on the concrete resolver.
#[async_trait]
pub trait PairResolver: Send + Sync {
    async fn resolve_pair(&self, pair: &AddressPair) -> AppResult<DistanceResult>;
}

pub struct DistanceResolver {
    cache: Arc<GeocodingCache>,
    services: Vec<GeocodingService>,
}

impl DistanceResolver {
    pub fn new(cache: Arc<GeocodingCache>, services: Vec<GeocodingService>) -> Self {
        Self { cache, services }
    }

    pub fn cache(&self) -> &Arc<GeocodingCache> {
        &self.cache
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.services.iter().map(GeocodingService::id).collect()
    }

    pub async fn resolve(&self, pair: &AddressPair) -> DistanceResult {
        let (Some(origin), Some(destination)) = (
            normalize_commune_name(&pair.origin),
            normalize_commune_name(&pair.destination),
        ) else {
            debug!(
                target: "resolver",
                origin = %pair.origin,
                destination = %pair.destination,
                "address did not normalize"
            );
            return DistanceResult::invalid_address(pair.clone());
        };

        if origin == destination {
            debug!(target: "resolver", commune = %origin, "same commune on both sides");
            return DistanceResult {
                final_distance: Some(0.0),
                distance_by_source: self
                    .services
                    .iter()
                    .map(|service| (service.id(), Some(0.0)))
                    .collect(),
                source: DistanceSource::Both,
                status: ResolutionStatus::Ok,
                message: "same address detected".into(),
                discrepancy_percent: None,
                pair: pair.clone(),
            };
        }

        let origin_region = pair.origin_region.as_deref();
        let destination_region = pair.destination_region.as_deref();
        let per_service = join_all(self.services.iter().map(|service| {
            self.candidate(service, &origin, origin_region, &destination, destination_region)
        }))
        .await;

        let distance_by_source: BTreeMap<ServiceId, Option<f64>> = self
            .services
            .iter()
            .map(GeocodingService::id)
            .zip(per_service)
            .collect();
        let candidates: Vec<(ServiceId, f64)> = self
            .services
            .iter()
            .filter_map(|service| {
                distance_by_source
                    .get(&service.id())
                    .copied()
                    .flatten()
                    .map(|distance| (service.id(), distance))
            })
            .collect();

        let decision = reconcile(&candidates);
        debug!(
            target: "resolver",
            origin = %origin,
            destination = %destination,
            final_distance = ?decision.final_distance,
            source = decision.source.as_str(),
            status = decision.status.as_str(),
            "pair resolved"
        );
        if decision.status == ResolutionStatus::Warning {
            warn!(
                target: "resolver",
                origin = %origin,
                destination = %destination,
                discrepancy_percent = ?decision.discrepancy_percent,
                "services disagree"
            );
        }

        DistanceResult {
            final_distance: decision.final_distance,
            distance_by_source,
            source: decision.source,
            status: decision.status,
            message: decision.message,
            discrepancy_percent: decision.discrepancy_percent,
            pair: pair.clone(),
        }
    }

    async fn candidate(
        &self,
        service: &GeocodingService,
        origin: &str,
        origin_region: Option<&str>,
        destination: &str,
        destination_region: Option<&str>,
    ) -> Option<f64> {
        let from = self.locate(service, origin, origin_region).await;
        let to = self.locate(service, destination, destination_region).await;
        Some(candidate_distance_km(&from?, &to?))
    }

    /// Cache first; a miss costs exactly one geocoder call whose outcome is
    /// written back, tombstones included.
    async fn locate(
        &self,
        service: &GeocodingService,
        address: &str,
        region: Option<&str>,
    ) -> Option<GeoPoint> {
        match self.cache.get(address, service.id(), region) {
            Ok(CacheLookup::Hit(point)) => return point,
            Ok(CacheLookup::Miss) => {}
            Err(err) => warn!(
                target: "resolver",
                service = %service.id(),
                address,
                error = %err,
                "cache read failed; querying service"
            ),
        }

        let point = match service.geocode(address, region).await {
            Ok(point) => point,
            Err(AppError::RateLimited(id)) => {
                warn!(target: "resolver", service = %id, address, "rate limited; not caching");
                return None;
            }
            Err(err) => {
                warn!(
                    target: "resolver",
                    service = %service.id(),
                    address,
                    error = %err,
                    "geocoding failed"
                );
                None
            }
        };

        if let Err(err) = self.cache.set(address, service.id(), point, region) {
            warn!(
                target: "resolver",
                service = %service.id(),
                address,
                error = %err,
                "cache write failed"
            );
        }
        point
    }
}

#[async_trait]
impl PairResolver for DistanceResolver {
    async fn resolve_pair(&self, pair: &AddressPair) -> AppResult<DistanceResult> {
        Ok(self.resolve(pair).await)
    }
}
