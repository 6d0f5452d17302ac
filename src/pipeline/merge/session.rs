//! Serialized inbox for one conversation.
//!
//! Subscription pushes, poll ticks, refetches and local sends all become
//! `Delivery` values on one channel. A single task owns the message sequence
//! and applies deliveries one at a time, so merges never overlap. The
//! render-ready view is published through a `watch` channel.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::engine::MergeEngine;
use super::refetch::{refetch_and_replace, ConversationFetcher, RefetchPolicy};
use super::{MergeError, MustRefreshReason, SessionError};
use crate::config::SESSION_INBOX_CAPACITY;
use crate::models::{DeliverySource, Message};
use crate::pipeline::stability::StabilityStats;

/// One unit of work for the session task.
#[derive(Debug)]
pub enum Delivery {
    Batch {
        source: DeliverySource,
        messages: Vec<Message>,
    },
    /// Toggle the "assistant is composing" indicator. UI state only.
    Composing(bool),
    /// Acknowledged once every earlier delivery has been applied.
    Barrier(oneshot::Sender<()>),
}

/// What the renderer sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionView {
    pub messages: Vec<Message>,
    pub composing: bool,
    /// Set once refetching has given up. Terminal for this session.
    pub must_refresh: Option<MustRefreshReason>,
}

pub struct ConversationSession<F: ConversationFetcher> {
    conversation_id: String,
    engine: MergeEngine,
    fetcher: Arc<F>,
    refetch: RefetchPolicy,
    stats: Arc<StabilityStats>,
    view: SessionView,
}

impl<F: ConversationFetcher + 'static> ConversationSession<F> {
    /// Start the session task and return a handle to it.
    pub fn spawn(
        conversation_id: impl Into<String>,
        engine: MergeEngine,
        fetcher: Arc<F>,
        refetch: RefetchPolicy,
        stats: Arc<StabilityStats>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::channel(SESSION_INBOX_CAPACITY);
        let (view_tx, view_rx) = watch::channel(SessionView::default());

        let session = Self {
            conversation_id: conversation_id.into(),
            engine,
            fetcher,
            refetch,
            stats: Arc::clone(&stats),
            view: SessionView::default(),
        };
        let task = tokio::spawn(session.run(rx, view_tx));

        SessionHandle {
            tx,
            view: view_rx,
            stats,
            task,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Delivery>, view_tx: watch::Sender<SessionView>) {
        tracing::debug!(conversation_id = %self.conversation_id, "Conversation session started");

        while let Some(delivery) = rx.recv().await {
            match delivery {
                Delivery::Batch { source, messages } => {
                    self.apply_batch(source, &messages, &view_tx).await;
                }
                Delivery::Composing(composing) => {
                    self.view.composing = composing;
                    view_tx.send_replace(self.view.clone());
                }
                Delivery::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        tracing::debug!(conversation_id = %self.conversation_id, "Conversation session closed");
    }

    async fn apply_batch(
        &mut self,
        source: DeliverySource,
        messages: &[Message],
        view_tx: &watch::Sender<SessionView>,
    ) {
        let before = assistant_count(&self.view.messages);
        let outcome = self.engine.merge(&self.view.messages, messages, &self.stats);

        tracing::debug!(
            conversation_id = %self.conversation_id,
            source = %source,
            incoming = messages.len(),
            total = outcome.messages.len(),
            rejected = outcome.rejected.len(),
            "Batch merged"
        );

        self.view.messages = outcome.messages;
        if assistant_count(&self.view.messages) > before {
            self.view.composing = false;
        }
        // Publish the safe part first; the refetch below may take a while.
        view_tx.send_replace(self.view.clone());

        if !outcome.refetch_required || self.view.must_refresh.is_some() {
            return;
        }

        match refetch_and_replace(
            self.fetcher.as_ref(),
            &self.conversation_id,
            &self.view.messages,
            &outcome.rejected,
            &self.engine,
            &self.refetch,
            &self.stats,
        )
        .await
        {
            Ok(replaced) => {
                let before = assistant_count(&self.view.messages);
                self.view.messages = replaced;
                if assistant_count(&self.view.messages) > before {
                    self.view.composing = false;
                }
            }
            Err(MergeError::MustRefresh { attempts, reason }) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    attempts,
                    reason = %reason,
                    "Session requires refresh"
                );
                self.view.must_refresh = Some(reason);
                self.view.composing = false;
            }
        }
        view_tx.send_replace(self.view.clone());
    }
}

fn assistant_count(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.is_assistant()).count()
}

/// Caller side of a running session.
pub struct SessionHandle {
    tx: mpsc::Sender<Delivery>,
    view: watch::Receiver<SessionView>,
    stats: Arc<StabilityStats>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn deliver(
        &self,
        source: DeliverySource,
        messages: Vec<Message>,
    ) -> Result<(), SessionError> {
        self.send(Delivery::Batch { source, messages }).await
    }

    pub async fn set_composing(&self, composing: bool) -> Result<(), SessionError> {
        self.send(Delivery::Composing(composing)).await
    }

    /// Wait until every delivery sent before this call has been applied.
    pub async fn settle(&self) -> Result<(), SessionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Delivery::Barrier(ack_tx)).await?;
        ack_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Latest published view.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn stats(&self) -> &StabilityStats {
        &self.stats
    }

    /// Close the inbox and wait for pending deliveries to drain.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Conversation session task failed");
        }
    }

    async fn send(&self, delivery: Delivery) -> Result<(), SessionError> {
        self.tx.send(delivery).await.map_err(|_| SessionError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::models::MessageRole;
    use crate::pipeline::merge::FetchError;
    use crate::pipeline::safety::policy::CompiledPolicy;
    use crate::pipeline::stability::Counter;

    struct StaticFetcher(Mutex<Result<Vec<Message>, FetchError>>);

    impl ConversationFetcher for StaticFetcher {
        fn fetch_messages(
            &self,
            _conversation_id: &str,
        ) -> impl Future<Output = Result<Vec<Message>, FetchError>> + Send {
            let response = self.0.lock().unwrap().clone();
            async move { response }
        }
    }

    fn spawn(fetch: Result<Vec<Message>, FetchError>) -> SessionHandle {
        ConversationSession::spawn(
            "c1",
            MergeEngine::new(CompiledPolicy::builtin()),
            Arc::new(StaticFetcher(Mutex::new(fetch))),
            RefetchPolicy {
                max_attempts: 2,
                timeout: Duration::from_secs(5),
                backoff: Duration::ZERO,
            },
            Arc::new(StabilityStats::new()),
        )
    }

    fn assistant(id: &str, text: &str, turn: u64) -> Message {
        Message::new(MessageRole::Assistant, text, turn).with_id(id)
    }

    #[tokio::test]
    async fn subscription_then_poll_yields_one_bubble() {
        let session = spawn(Ok(vec![]));
        session
            .deliver(DeliverySource::Subscription, vec![assistant("m1", "Partial", 1)])
            .await
            .unwrap();
        session
            .deliver(DeliverySource::Poll, vec![assistant("m1", "Partial, then complete.", 1)])
            .await
            .unwrap();
        session.settle().await.unwrap();

        let view = session.view();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].display_content, "Partial, then complete.");
        assert!(session.stats().report().passed);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn composing_is_ui_flag_cleared_by_reply() {
        let session = spawn(Ok(vec![]));
        session.set_composing(true).await.unwrap();
        session.settle().await.unwrap();
        assert!(session.view().composing);
        assert!(session.view().messages.is_empty());

        session
            .deliver(DeliverySource::Subscription, vec![assistant("a1", "Hi!", 1)])
            .await
            .unwrap();
        session.settle().await.unwrap();
        let view = session.view();
        assert!(!view.composing);
        assert_eq!(view.messages.len(), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn placeholder_delivery_never_stored() {
        let session = spawn(Ok(vec![]));
        session
            .deliver(DeliverySource::Local, vec![assistant("typing-42", "...", 1)])
            .await
            .unwrap();
        session.settle().await.unwrap();
        assert!(session.view().messages.is_empty());
        assert_eq!(session.stats().get(Counter::PlaceholderBecameMessage), 0);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn refetch_without_rejected_reply_ends_composing_with_refresh() {
        let session = spawn(Ok(vec![]));
        session.set_composing(true).await.unwrap();
        session
            .deliver(DeliverySource::Subscription, vec![assistant("a1", "{\"oops\": 1}", 1)])
            .await
            .unwrap();
        session.settle().await.unwrap();

        let view = session.view();
        assert!(view.messages.is_empty());
        assert!(!view.composing);
        assert_eq!(view.must_refresh, Some(MustRefreshReason::AttemptsExhausted));
        assert_eq!(session.stats().get(Counter::RefetchTriggered), 2);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn unsafe_delivery_replaced_by_refetch() {
        let session = spawn(Ok(vec![assistant("a1", "Clean reply.", 1)]));
        session
            .deliver(DeliverySource::Subscription, vec![assistant("a1", "{\"oops\": 1}", 1)])
            .await
            .unwrap();
        session.settle().await.unwrap();

        let view = session.view();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].display_content, "Clean reply.");
        assert!(view.must_refresh.is_none());
        assert_eq!(session.stats().get(Counter::RefetchTriggered), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn persistent_failure_sets_must_refresh_and_keeps_safe_view() {
        let session = spawn(Err(FetchError::Unavailable("offline".into())));
        session
            .deliver(DeliverySource::Local, vec![Message::new(MessageRole::User, "hello", 0).with_id("u1")])
            .await
            .unwrap();
        session
            .deliver(DeliverySource::Subscription, vec![assistant("a1", "```\nraw\n```", 1)])
            .await
            .unwrap();
        session.settle().await.unwrap();

        let view = session.view();
        assert_eq!(view.must_refresh, Some(MustRefreshReason::AttemptsExhausted));
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].display_content, "hello");
        assert_eq!(session.stats().get(Counter::RefetchTriggered), 2);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn subscribers_observe_updates() {
        let session = spawn(Ok(vec![]));
        let mut rx = session.subscribe();
        session
            .deliver(DeliverySource::Poll, vec![assistant("a1", "Polled.", 1)])
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().messages.len(), 1);
        session.shutdown().await;
    }
}
