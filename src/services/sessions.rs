//! Session-scoped fan-out for streamed retrieval.
//!
//! A session is a caller-chosen id. Producers and subscribers meet on the
//! same channel whichever arrives first; every subscriber sees every event
//! published after it joined. Nothing is buffered for late subscribers.
//! Producers end a session with `SessionEvent::Complete`, which also tears
//! the channel down.

use crate::models::file_record::FileView;
use futures::{Stream, stream};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::mpsc, time::timeout};
use tracing::debug;

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Record(Box<FileView>),
    /// The producer has emitted everything it will emit.
    Complete,
}

/// One session: an unbounded queue per subscriber, so a slow subscriber
/// never loses events and never holds the producer back.
#[derive(Default)]
struct Channel {
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
    producers: usize,
}

impl Channel {
    fn send(&mut self, event: &SessionEvent) -> usize {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        self.subscribers.len()
    }

    fn is_idle(&self) -> bool {
        self.producers == 0 && self.subscribers.iter().all(|tx| tx.is_closed())
    }
}

#[derive(Clone, Default)]
pub struct SessionHub {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start producing into a session.
    pub fn publisher(&self, session_id: &str) -> SessionPublisher {
        self.lock()
            .entry(session_id.to_string())
            .or_default()
            .producers += 1;
        SessionPublisher {
            hub: self.clone(),
            session_id: session_id.to_string(),
            finished: false,
        }
    }

    /// Subscribe to a session. The stream ends after `Complete`, when the
    /// session is torn down, or after `idle` passes without an event.
    pub fn subscribe(
        &self,
        session_id: &str,
        idle: Duration,
    ) -> impl Stream<Item = SessionEvent> + Send + use<> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .entry(session_id.to_string())
            .or_default()
            .subscribers
            .push(tx);
        let subscription = Subscription {
            rx: Some(rx),
            hub: self.clone(),
            session_id: session_id.to_string(),
        };

        stream::unfold(subscription, move |mut sub| async move {
            let rx = sub.rx.as_mut()?;
            match timeout(idle, rx.recv()).await {
                Ok(Some(SessionEvent::Complete)) => {
                    sub.close();
                    Some((SessionEvent::Complete, sub))
                }
                Ok(Some(event)) => Some((event, sub)),
                Ok(None) | Err(_) => {
                    debug!(session = %sub.session_id, "subscription ended without completion");
                    sub.close();
                    None
                }
            }
        })
    }

    fn send(&self, session_id: &str, event: SessionEvent) -> usize {
        match self.lock().get_mut(session_id) {
            Some(channel) => channel.send(&event),
            None => 0,
        }
    }

    /// Drop a session that has neither live subscribers nor producers left.
    fn release(&self, session_id: &str) {
        let mut map = self.lock();
        if map.get(session_id).is_some_and(Channel::is_idle) {
            map.remove(session_id);
        }
    }

    /// Deliver `Complete` to every subscriber and, once the last producer
    /// is done, tear the session down.
    fn finish_producer(&self, session_id: &str) {
        let mut map = self.lock();
        let done = match map.get_mut(session_id) {
            Some(channel) => {
                channel.send(&SessionEvent::Complete);
                channel.producers = channel.producers.saturating_sub(1);
                channel.producers == 0
            }
            None => false,
        };
        if done {
            map.remove(session_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn open_sessions(&self) -> usize {
        self.lock().len()
    }
}

/// Write side of one session.
pub struct SessionPublisher {
    hub: SessionHub,
    session_id: String,
    finished: bool,
}

impl SessionPublisher {
    /// Publish to whoever is subscribed right now.
    pub fn publish(&self, view: FileView) {
        let delivered = self
            .hub
            .send(&self.session_id, SessionEvent::Record(Box::new(view)));
        if delivered == 0 {
            debug!(session = %self.session_id, "no subscribers, event dropped");
        }
    }

    /// Emit the completion sentinel and tear the session down.
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.hub.finish_producer(&self.session_id);
    }
}

impl Drop for SessionPublisher {
    fn drop(&mut self) {
        self.complete();
    }
}

struct Subscription {
    rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    hub: SessionHub,
    session_id: String,
}

impl Subscription {
    fn close(&mut self) {
        if let Some(rx) = self.rx.take() {
            drop(rx);
            self.hub.release(&self.session_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
