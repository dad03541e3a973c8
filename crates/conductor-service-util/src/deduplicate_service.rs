use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use conductor_packet::{ErrorCode, RejectBuilder};
use conductor_service::*;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Extension trait for [`Account`] with the account's retry-deduplication
/// window. A zero window disables deduplication.
pub trait DeduplicateAccount: Account {
    fn deduplicate_window(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// A packet's identity for deduplication purposes. Two prepares that agree
/// on all four fields are the same payment attempt; the data field is
/// deliberately excluded because retries may re-randomize padding.
#[derive(Clone, Eq, PartialEq, Hash)]
struct CacheKey {
    destination: String,
    amount: u64,
    execution_condition: [u8; 32],
    expires_at: SystemTime,
}

impl CacheKey {
    fn of(prepare: &conductor_packet::Prepare) -> Self {
        let mut execution_condition = [0; 32];
        execution_condition.copy_from_slice(prepare.execution_condition());
        CacheKey {
            destination: prepare.destination().to_string(),
            amount: prepare.amount(),
            execution_condition,
            expires_at: prepare.expires_at(),
        }
    }
}

enum CacheEntry {
    /// The first copy is still being forwarded; followers subscribe.
    InFlight(broadcast::Sender<IlpResult>),
    /// The response, replayed to identical retries within the window.
    Done {
        result: IlpResult,
        cached_at: Instant,
        window: Duration,
    },
}

enum Action {
    Forward(broadcast::Sender<IlpResult>),
    Replay(IlpResult),
    Wait(broadcast::Receiver<IlpResult>),
}

/// # Deduplicate Service
///
/// Outgoing middleware that answers identical retries from the cache
/// instead of forwarding them again. A retry that races the original
/// in-flight packet shares its single response, so one payment attempt
/// never leaves this node twice within the window.
#[derive(Clone)]
pub struct DeduplicateService<S, O> {
    store: S,
    cache: Arc<Mutex<HashMap<CacheKey, CacheEntry>>>,
    next: O,
}

impl<S, O> DeduplicateService<S, O> {
    pub fn new(store: S, next: O) -> Self {
        DeduplicateService {
            store,
            cache: Arc::new(Mutex::new(HashMap::new())),
            next,
        }
    }
}

#[async_trait]
impl<S, O, A> OutgoingService<A> for DeduplicateService<S, O>
where
    S: AddressStore + Send + Sync + 'static,
    O: OutgoingService<A> + Send + Sync + 'static,
    A: DeduplicateAccount + Sync + 'static,
{
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        let window = request.to.deduplicate_window();
        if window == Duration::from_millis(0) {
            return self.next.send_request(request).await;
        }

        let key = CacheKey::of(&request.prepare);
        let action = {
            let mut cache = self.cache.lock();
            cache.retain(|_, entry| match entry {
                CacheEntry::InFlight(_) => true,
                CacheEntry::Done {
                    cached_at, window, ..
                } => cached_at.elapsed() <= *window,
            });

            match cache.get(&key) {
                Some(CacheEntry::Done { result, .. }) => Action::Replay(result.clone()),
                Some(CacheEntry::InFlight(sender)) => Action::Wait(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    cache.insert(key.clone(), CacheEntry::InFlight(sender.clone()));
                    Action::Forward(sender)
                }
            }
        };

        match action {
            Action::Replay(result) => {
                debug!(
                    "Replaying cached response for duplicate packet to account {}",
                    request.to.id()
                );
                result
            }
            Action::Wait(mut receiver) => {
                trace!(
                    "Duplicate packet to account {} is sharing an in-flight response",
                    request.to.id()
                );
                match receiver.recv().await {
                    Ok(result) => result,
                    // the forwarding task died without answering
                    Err(_) => Err(RejectBuilder {
                        code: ErrorCode::T00_INTERNAL_ERROR,
                        message: b"duplicate packet lost its in-flight original",
                        triggered_by: Some(&self.store.get_ilp_address()),
                        data: &[],
                    }
                    .build()),
                }
            }
            Action::Forward(sender) => {
                let result = self.next.send_request(request).await;
                let mut cache = self.cache.lock();
                cache.insert(
                    key,
                    CacheEntry::Done {
                        result: result.clone(),
                        cached_at: Instant::now(),
                        window,
                    },
                );
                // no receivers is fine: nobody raced us
                let _ = sender.send(result.clone());
                result
            }
        }
    }
}
