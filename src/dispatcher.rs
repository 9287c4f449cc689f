use std::sync::Arc;

use futures::stream::{FuturesUnordered, Stream};
use futures::FutureExt;
use log::{debug, error};
use tokio::sync::Semaphore;

use crate::credential::validate;
use crate::error::DispatchError;
use crate::fetcher::TokenFetcher;
use crate::models::{FetchOutcome, RawRecord};

pub const DEFAULT_CONCURRENCY: usize = 10;

/// Fans a batch out to the token fetcher under a concurrency cap.
///
/// Each call to [`Dispatcher::run`] gets its own admission gate, so runs
/// started from different callers never share or starve each other's permits.
pub struct Dispatcher {
    fetcher: Arc<dyn TokenFetcher>,
    limit: usize,
}

impl Dispatcher {
    pub fn new(fetcher: Arc<dyn TokenFetcher>, limit: usize) -> Result<Self, DispatchError> {
        if limit == 0 {
            return Err(DispatchError::ZeroLimit);
        }
        if limit > Semaphore::MAX_PERMITS {
            return Err(DispatchError::LimitTooLarge(limit));
        }
        Ok(Self { fetcher, limit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Schedules every record immediately and yields outcomes in completion order.
    ///
    /// Invalid records resolve to a failure without taking a permit. A unit of
    /// work that panics is reported as an `Internal task error` failure for its
    /// own record; the rest of the batch is unaffected.
    pub fn run(&self, records: Vec<RawRecord>) -> impl Stream<Item = FetchOutcome> + Send + Unpin {
        let gate = Arc::new(Semaphore::new(self.limit));

        records
            .into_iter()
            .map(|raw| {
                let fallback = raw.clone();
                let fetcher = Arc::clone(&self.fetcher);
                let gate = Arc::clone(&gate);

                tokio::spawn(async move {
                    let record = match validate(&raw) {
                        Ok(record) => record,
                        Err(err) => {
                            debug!("Skipping record without network call: {}", err);
                            return FetchOutcome::failure(raw, err.to_string());
                        }
                    };

                    let _permit = match gate.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return FetchOutcome::failure(raw, "Internal task error: admission gate closed")
                        }
                    };
                    fetcher.fetch(record).await
                })
                .map(move |joined| {
                    joined.unwrap_or_else(|err| {
                        error!("Batch unit failed: {}", err);
                        FetchOutcome::failure(fallback, format!("Internal task error: {}", err))
                    })
                })
            })
            .collect::<FuturesUnordered<_>>()
    }
}
