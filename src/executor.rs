use std::any::Any;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

use crate::errors::AppError;
use crate::resolver::{AddressPair, DistanceResult, PairResolver};

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Resolves every pair with at most `concurrency` resolutions in flight and
/// returns the results in input order.
///
/// Never fails as a whole: a resolver error or a panicking task becomes an
/// error result for that pair only.
pub async fn run_parallel<R>(
    pairs: Vec<AddressPair>,
    resolver: Arc<R>,
    concurrency: usize,
) -> Vec<DistanceResult>
where
    R: PairResolver + ?Sized + 'static,
{
    let total = pairs.len();
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    debug!(
        target: "parallel_executor",
        pairs = total,
        concurrency = concurrency.max(1),
        "starting parallel resolution"
    );

    let mut in_flight = FuturesUnordered::new();
    for (index, pair) in pairs.iter().cloned().enumerate() {
        let permits = Arc::clone(&permits);
        let resolver = Arc::clone(&resolver);
        let handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|err| AppError::Worker(err.to_string()))?;
            resolver.resolve_pair(&pair).await
        });
        in_flight.push(async move { (index, handle.await) });
    }

    let mut slots: Vec<Option<DistanceResult>> = vec![None; total];
    while let Some((index, joined)) = in_flight.next().await {
        let pair = pairs[index].clone();
        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(target: "parallel_executor", index, error = %err, "resolution failed");
                DistanceResult::worker_failure(pair, err)
            }
            Err(join_err) => {
                let reason = describe_join_error(join_err);
                error!(target: "parallel_executor", index, reason = %reason, "resolution task aborted");
                DistanceResult::worker_failure(pair, reason)
            }
        };
        slots[index] = Some(result);
    }

    slots
        .into_iter()
        .zip(pairs)
        .map(|(slot, pair)| {
            slot.unwrap_or_else(|| DistanceResult::worker_failure(pair, "no result produced"))
        })
        .collect()
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => format!("task panicked: {}", panic_message(payload.as_ref())),
        Err(err) => err.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::sleep;

    use crate::errors::AppResult;
    use crate::resolver::{DistanceSource, ResolutionStatus};

    use super::*;

    /// Echoes the origin's length as a distance; origin names drive
    /// failures (`fail`, `panic`) and delays (`slow-N`).
    #[derive(Default)]
    struct ScriptedResolver {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl PairResolver for ScriptedResolver {
        async fn resolve_pair(&self, pair: &AddressPair) -> AppResult<DistanceResult> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = pair
                .origin
                .strip_prefix("slow-")
                .and_then(|ms| ms.parse::<u64>().ok())
                .unwrap_or(5);
            sleep(Duration::from_millis(delay)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            match pair.origin.as_str() {
                "fail" => Err(AppError::Worker("boom".into())),
                "panic" => panic!("resolver exploded"),
                _ => Ok(DistanceResult {
                    final_distance: Some(pair.origin.len() as f64),
                    distance_by_source: Default::default(),
                    source: DistanceSource::Nominatim,
                    status: ResolutionStatus::Ok,
                    message: String::new(),
                    discrepancy_percent: None,
                    pair: pair.clone(),
                }),
            }
        }
    }

    fn pairs(origins: &[&str]) -> Vec<AddressPair> {
        origins
            .iter()
            .map(|origin| AddressPair::new(*origin, "LYON"))
            .collect()
    }

    #[tokio::test]
    async fn preserves_input_order_under_uneven_delays() {
        let input = pairs(&["slow-80", "slow-5", "slow-40", "slow-1", "slow-20"]);
        let results = run_parallel(input.clone(), Arc::new(ScriptedResolver::default()), 5).await;

        assert_eq!(results.len(), input.len());
        for (result, pair) in results.iter().zip(&input) {
            assert_eq!(&result.pair, pair);
            assert_eq!(result.status, ResolutionStatus::Ok);
        }
    }

    #[tokio::test]
    async fn isolates_errors_and_panics() {
        let input = pairs(&["PARIS", "fail", "panic", "NICE"]);
        let results = run_parallel(input, Arc::new(ScriptedResolver::default()), 2).await;

        assert_eq!(results[0].status, ResolutionStatus::Ok);
        assert_eq!(results[1].status, ResolutionStatus::Error);
        assert!(results[1].message.contains("boom"));
        assert_eq!(results[2].status, ResolutionStatus::Error);
        assert!(results[2].message.contains("resolver exploded"));
        assert_eq!(results[2].pair.origin, "panic");
        assert_eq!(results[3].final_distance, Some(4.0));
    }

    #[tokio::test]
    async fn bounds_concurrency() {
        let resolver = Arc::new(ScriptedResolver::default());
        let input = pairs(&["slow-20"; 12]);
        let results = run_parallel(input, Arc::clone(&resolver), 3).await;

        assert_eq!(results.len(), 12);
        let peak = resolver.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn handles_empty_input_and_zero_concurrency() {
        let resolver = Arc::new(ScriptedResolver::default());
        assert!(run_parallel(Vec::new(), Arc::clone(&resolver), 4).await.is_empty());

        let results = run_parallel(pairs(&["LILLE"]), resolver, 0).await;
        assert_eq!(results[0].final_distance, Some(5.0));
    }
}
