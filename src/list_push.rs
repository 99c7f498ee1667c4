use crate::catalog::CatalogService;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Added { attempts: u32 },
    Abandoned { attempts: u32 },
}

impl PushOutcome {
    pub fn is_added(&self) -> bool {
        matches!(self, PushOutcome::Added { .. })
    }
}

/// Delay before retry number `attempt` (1-based count of failed attempts).
pub fn backoff_for(attempt: u32) -> Duration {
    BASE_BACKOFF * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Add a book to an external list. Only rate limiting is retried, with
/// exponential backoff and at most [`MAX_ATTEMPTS`] calls; every other error
/// is logged and the push abandoned.
#[instrument(skip_all, fields(list_id = list_id, book_id = book_id))]
pub async fn push_with_retry(
    catalog: &dyn CatalogService,
    list_id: &str,
    book_id: &str,
) -> PushOutcome {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match catalog.add_to_list(list_id, book_id).await {
            Ok(()) => {
                info!(attempt, "book pushed to list");
                return PushOutcome::Added { attempts: attempt };
            }
            Err(err) if err.is_rate_limited() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "list push rate limited; backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(?err, attempt, "list push abandoned");
                return PushOutcome::Abandoned { attempts: attempt };
            }
        }
    }
}
