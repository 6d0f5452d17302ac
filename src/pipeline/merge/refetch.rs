use std::future::Future;
use std::time::Duration;

use super::engine::{holds_safe_turn, MergeEngine};
use super::{FetchError, MergeError, MustRefreshReason};
use crate::config::{DEFAULT_REFETCH_ATTEMPTS, DEFAULT_REFETCH_TIMEOUT};
use crate::models::{DedupKey, Message};
use crate::pipeline::stability::{Counter, StabilityStats};

/// Bounds for the refetch-and-replace path. Supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefetchPolicy {
    pub max_attempts: u32,
    /// Overall budget for all attempts together.
    pub timeout: Duration,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RefetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_REFETCH_ATTEMPTS,
            timeout: DEFAULT_REFETCH_TIMEOUT,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Fetches the authoritative message list for a conversation.
pub trait ConversationFetcher: Send + Sync {
    fn fetch_messages(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, FetchError>> + Send;
}

/// Replace rejected content with a fresh server copy.
///
/// Each attempt fetches the conversation and merges it over `current`. The
/// first attempt whose merge passes the render-safety gate and holds a safe
/// copy of every `rejected` turn wins. A fetch that has not caught up with
/// the rejected turns yet counts as a failed attempt. After
/// `max_attempts` failures, or when the overall timeout elapses, returns the
/// terminal `MustRefresh` signal. `current` is never modified, so the caller
/// keeps showing the last safe sequence meanwhile.
pub async fn refetch_and_replace<F: ConversationFetcher>(
    fetcher: &F,
    conversation_id: &str,
    current: &[Message],
    rejected: &[DedupKey],
    engine: &MergeEngine,
    policy: &RefetchPolicy,
    stats: &StabilityStats,
) -> Result<Vec<Message>, MergeError> {
    let mut attempts = 0u32;

    let outcome = tokio::time::timeout(policy.timeout, async {
        while attempts < policy.max_attempts {
            if attempts > 0 && !policy.backoff.is_zero() {
                tokio::time::sleep(policy.backoff).await;
            }
            attempts += 1;
            stats.record(Counter::RefetchTriggered);
            tracing::info!(conversation_id, attempt = attempts, "Refetching conversation");

            match fetcher.fetch_messages(conversation_id).await {
                Ok(fetched) => {
                    let merged = engine.merge(current, &fetched, stats);
                    let missing = rejected
                        .iter()
                        .filter(|key| !holds_safe_turn(&merged.messages, key))
                        .count();
                    if !merged.refetch_required && missing == 0 {
                        return Some(merged.messages);
                    }
                    tracing::warn!(
                        conversation_id,
                        attempt = attempts,
                        rejected = merged.rejected.len(),
                        missing,
                        "Refetched content still unsafe or incomplete"
                    );
                }
                Err(e) => {
                    tracing::warn!(conversation_id, attempt = attempts, error = %e, "Refetch failed");
                }
            }
        }
        None
    })
    .await;

    match outcome {
        Ok(Some(messages)) => Ok(messages),
        Ok(None) => {
            tracing::warn!(conversation_id, attempts, "Refetch attempts exhausted, must refresh");
            Err(MergeError::MustRefresh {
                attempts,
                reason: MustRefreshReason::AttemptsExhausted,
            })
        }
        Err(_) => {
            tracing::warn!(
                conversation_id,
                attempts,
                timeout_ms = policy.timeout.as_millis() as u64,
                "Refetch timed out, must refresh"
            );
            Err(MergeError::MustRefresh {
                attempts,
                reason: MustRefreshReason::TimedOut,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::models::MessageRole;
    use crate::pipeline::safety::policy::CompiledPolicy;

    /// Serves scripted responses in order; repeats the last one.
    struct ScriptedFetcher {
        responses: Mutex<Vec<Result<Vec<Message>, FetchError>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<Vec<Message>, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ConversationFetcher for ScriptedFetcher {
        fn fetch_messages(
            &self,
            _conversation_id: &str,
        ) -> impl Future<Output = Result<Vec<Message>, FetchError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut responses = self.responses.lock().unwrap();
                if responses.len() > 1 {
                    responses.remove(0)
                } else {
                    responses[0].clone()
                }
            };
            let delay = self.delay;
            async move {
                tokio::time::sleep(delay).await;
                next
            }
        }
    }

    fn fast() -> RefetchPolicy {
        RefetchPolicy {
            max_attempts: 3,
            timeout: Duration::from_secs(5),
            backoff: Duration::ZERO,
        }
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(CompiledPolicy::builtin())
    }

    fn safe() -> Vec<Message> {
        vec![Message::new(MessageRole::Assistant, "All good now.", 1).with_id("a1")]
    }

    fn unsafe_reply() -> Vec<Message> {
        vec![Message::new(MessageRole::Assistant, "{\"raw\": true}", 1).with_id("a1")]
    }

    #[test]
    fn default_policy_uses_config_bounds() {
        let p = RefetchPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn first_safe_fetch_wins() {
        let fetcher = ScriptedFetcher::new(vec![Ok(safe())]);
        let stats = StabilityStats::new();
        let out = refetch_and_replace(&fetcher, "c1", &[], &[], &engine(), &fast(), &stats)
            .await
            .unwrap();
        assert_eq!(out[0].display_content, "All good now.");
        assert_eq!(stats.get(Counter::RefetchTriggered), 1);
    }

    #[tokio::test]
    async fn retries_until_safe() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Unavailable("503".into())),
            Ok(unsafe_reply()),
            Ok(safe()),
        ]);
        let stats = StabilityStats::new();
        let out = refetch_and_replace(&fetcher, "c1", &[], &[], &engine(), &fast(), &stats).await;
        assert!(out.is_ok());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.get(Counter::RefetchTriggered), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_must_refresh() {
        let fetcher = ScriptedFetcher::new(vec![Ok(unsafe_reply())]);
        let stats = StabilityStats::new();
        let err = refetch_and_replace(&fetcher, "c1", &[], &[], &engine(), &fast(), &stats)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MergeError::MustRefresh {
                attempts: 3,
                reason: MustRefreshReason::AttemptsExhausted
            }
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let mut fetcher = ScriptedFetcher::new(vec![Ok(safe())]);
        fetcher.delay = Duration::from_secs(5);
        let policy = RefetchPolicy {
            timeout: Duration::from_millis(30),
            ..fast()
        };
        let stats = StabilityStats::new();
        let err = refetch_and_replace(&fetcher, "c1", &[], &[], &engine(), &policy, &stats)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MergeError::MustRefresh {
                attempts: 1,
                reason: MustRefreshReason::TimedOut
            }
        ));
    }

    #[tokio::test]
    async fn current_sequence_is_preserved_on_success() {
        let current = vec![Message::new(MessageRole::User, "hello", 0).with_id("u1")];
        let fetcher = ScriptedFetcher::new(vec![Ok(safe())]);
        let stats = StabilityStats::new();
        let out = refetch_and_replace(&fetcher, "c1", &current, &[], &engine(), &fast(), &stats)
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn fetch_missing_rejected_turn_keeps_retrying() {
        let rejected = vec![DedupKey::Id("a1".into())];
        let fetcher = ScriptedFetcher::new(vec![Ok(vec![]), Ok(safe())]);
        let stats = StabilityStats::new();
        let out = refetch_and_replace(&fetcher, "c1", &[], &rejected, &engine(), &fast(), &stats)
            .await
            .unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out[0].id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn rejected_turn_never_served_must_refresh() {
        let rejected = vec![DedupKey::Id("a1".into())];
        let fetcher = ScriptedFetcher::new(vec![Ok(vec![])]);
        let stats = StabilityStats::new();
        let err = refetch_and_replace(&fetcher, "c1", &[], &rejected, &engine(), &fast(), &stats)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MergeError::MustRefresh {
                attempts: 3,
                reason: MustRefreshReason::AttemptsExhausted
            }
        );
    }
}
