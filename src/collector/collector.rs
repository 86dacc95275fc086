use super::CollectorManager;
use crate::channel::MessageHandler;
use crate::message::{Acknowledge, Message};
use crate::timer::{TimerHandle, TimerService};
use crate::EmptyResult;
use async_trait::async_trait;
use futures::lock::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Cause of a conversation ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Every announced or requested response has been received
    AllResponsesReceived,
    /// No responder acknowledged the request in time
    AckTimeout,
    /// Responses stopped arriving before the expected count was reached
    ResponseTimeout,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EndReason::AllResponsesReceived => "all responses received",
            EndReason::AckTimeout => "acknowledgement timeout",
            EndReason::ResponseTimeout => "response timeout",
        };

        write!(f, "{}", text)
    }
}

/// Summary handed to the end callback of a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEnd {
    /// Correlation id of the conversation
    pub correlation_id: String,
    /// What caused the conversation to end
    pub reason: EndReason,
    /// Number of replies carrying a payload
    pub responses_received: usize,
    /// Responders which acknowledged the request, in order of their first acknowledgement
    pub acknowledged_by: Vec<String>,
}

/// Called for every acknowledgement, including repeated ones from the same responder
pub type AckCallback = Arc<dyn Fn(&Acknowledge) + Send + Sync>;
/// Called for every reply carrying a payload
pub type ResponseCallback = Arc<dyn Fn(&Message) + Send + Sync>;
/// Called exactly once when the conversation ends
pub type EndCallback = Arc<dyn Fn(&ConversationEnd) + Send + Sync>;

/// Application hooks of a conversation. They run on a runtime worker, not on the publishing task.
#[derive(Clone, Default)]
pub struct CollectorCallbacks {
    pub on_acknowledge: Option<AckCallback>,
    pub on_response: Option<ResponseCallback>,
    pub on_end: Option<EndCallback>,
}

/// Expectations of a conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Time within which at least one acknowledgement is expected
    pub ack_timeout: Option<Duration>,
    /// Time within which all responses are expected
    pub response_timeout: Option<Duration>,
    /// Number of responses to wait for, `None` relies on timeouts only
    pub responses_remaining: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Ack,
    Response,
}

struct ArmedTimer {
    handle: TimerHandle,
    epoch: u64,
}

struct CollectorState {
    ended: bool,
    response_timeout: Option<Duration>,
    responses_remaining: Option<i32>,
    remaining_declared: bool,
    responses_received: usize,
    acknowledged_by: Vec<String>,
    ack_timer: Option<ArmedTimer>,
    response_timer: Option<ArmedTimer>,
    epoch: u64,
}

/// Tracks a single outstanding request until it ends
///
/// All state transitions (inbound replies as well as timer expiry) are serialized
/// by one lock so that the conversation ends exactly once.
pub struct Collector {
    this: Weak<Collector>,
    correlation_id: String,
    ack_timeout: Option<Duration>,
    fallback_response_timeout: Duration,
    callbacks: CollectorCallbacks,
    timers: TimerService,
    manager: Weak<CollectorManager>,
    state: Mutex<CollectorState>,
}

impl Collector {
    /// Creates a collector for the conversation. Timers are armed by [`start`](Self::start).
    pub fn new(
        correlation_id: &str,
        settings: CollectorSettings,
        fallback_response_timeout: Duration,
        callbacks: CollectorCallbacks,
        timers: TimerService,
        manager: &Arc<CollectorManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            correlation_id: correlation_id.to_owned(),
            ack_timeout: settings.ack_timeout,
            fallback_response_timeout,
            callbacks,
            timers,
            manager: Arc::downgrade(manager),
            state: Mutex::new(CollectorState {
                ended: false,
                response_timeout: settings.response_timeout,
                responses_remaining: settings.responses_remaining,
                remaining_declared: false,
                responses_received: 0,
                acknowledged_by: Vec::new(),
                ack_timer: None,
                response_timer: None,
                epoch: 0,
            }),
        })
    }

    /// Correlation id of the tracked conversation
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Arms the response timer if a response timeout is known, the ack timer otherwise
    pub async fn start(&self) {
        let mut state = self.state.lock().await;

        if state.ended {
            return;
        }

        if let Some(timeout) = state.response_timeout {
            self.arm(&mut state, TimerKind::Response, timeout);
        } else if let Some(timeout) = self.ack_timeout {
            self.arm(&mut state, TimerKind::Ack, timeout);
        }
    }

    /// Whether the conversation is over
    pub async fn is_ended(&self) -> bool {
        self.state.lock().await.ended
    }

    /// Ends the conversation without notifying the application, e.g. because the request
    /// could not be published in the first place
    pub async fn abandon(&self) {
        {
            let mut state = self.state.lock().await;
            if state.ended {
                return;
            }

            state.ended = true;
            cancel_timers(&mut state);
        }

        self.unregister().await;
    }

    fn arm(&self, state: &mut CollectorState, kind: TimerKind, delay: Duration) {
        state.epoch += 1;
        let epoch = state.epoch;
        let collector = self.this.clone();

        let handle = self.timers.schedule(delay, async move {
            if let Some(collector) = collector.upgrade() {
                collector.expire(kind, epoch).await;
            }
        });

        let slot = match kind {
            TimerKind::Ack => &mut state.ack_timer,
            TimerKind::Response => &mut state.response_timer,
        };

        if let Some(previous) = slot.replace(ArmedTimer { handle, epoch }) {
            previous.handle.cancel();
        }

        trace!(correlation_id = %self.correlation_id, ?kind, ?delay, "Armed timer");
    }

    async fn expire(self: Arc<Self>, kind: TimerKind, epoch: u64) {
        let end = {
            let mut state = self.state.lock().await;

            let slot = match kind {
                TimerKind::Ack => &state.ack_timer,
                TimerKind::Response => &state.response_timer,
            };

            // Timers which have been replaced may still fire once
            let current = matches!(slot, Some(timer) if timer.epoch == epoch);
            if state.ended || !current {
                return;
            }

            let reason = match kind {
                TimerKind::Ack => EndReason::AckTimeout,
                TimerKind::Response => EndReason::ResponseTimeout,
            };

            self.finish(&mut state, reason)
        };

        self.complete(end).await;
    }

    fn process_ack(&self, state: &mut CollectorState, ack: &Acknowledge) {
        if state.acknowledged_by.contains(&ack.responder_id) {
            trace!(correlation_id = %self.correlation_id, responder_id = %ack.responder_id, "Ignoring repeated acknowledgement");
            return;
        }

        state.acknowledged_by.push(ack.responder_id.clone());

        if let (Some(remaining), false) = (ack.responses_remaining, state.remaining_declared) {
            state.responses_remaining = Some(remaining);
            state.remaining_declared = true;
        }

        if let Some(timer) = state.ack_timer.take() {
            timer.handle.cancel();
        }

        match ack.timeout_ms {
            Some(timeout) => self.arm(state, TimerKind::Response, Duration::from_millis(timeout)),
            None if state.response_timer.is_none() => {
                let timeout = state
                    .response_timeout
                    .unwrap_or(self.fallback_response_timeout);
                self.arm(state, TimerKind::Response, timeout);
            }
            None => {}
        }
    }

    fn finish(&self, state: &mut CollectorState, reason: EndReason) -> ConversationEnd {
        state.ended = true;
        cancel_timers(state);

        ConversationEnd {
            correlation_id: self.correlation_id.clone(),
            reason,
            responses_received: state.responses_received,
            acknowledged_by: state.acknowledged_by.clone(),
        }
    }

    async fn complete(&self, end: ConversationEnd) {
        debug!(correlation_id = %self.correlation_id, reason = %end.reason, responses = end.responses_received, "Conversation ended");

        if let Some(on_end) = &self.callbacks.on_end {
            self.guarded("end", || on_end(&end));
        }

        self.unregister().await;
    }

    /// Application callbacks must not prevent the conversation from being cleaned up
    fn guarded(&self, callback: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(correlation_id = %self.correlation_id, callback, "Conversation callback panicked");
        }
    }

    async fn unregister(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(&self.correlation_id).await;
        }
    }

    async fn process(&self, message: Message) {
        let end = {
            let mut state = self.state.lock().await;

            if state.ended {
                debug!(correlation_id = %self.correlation_id, "Dropping reply to ended conversation");
                return;
            }

            let mut remaining_changed = false;

            if let Some(ack) = &message.ack {
                let declared = state.remaining_declared;
                self.process_ack(&mut state, ack);
                remaining_changed = !declared && state.remaining_declared;

                if let Some(on_acknowledge) = &self.callbacks.on_acknowledge {
                    self.guarded("acknowledge", || on_acknowledge(ack));
                }
            }

            if message.is_response() {
                state.responses_received += 1;

                if let Some(remaining) = state.responses_remaining.as_mut() {
                    *remaining -= 1;
                    remaining_changed = true;
                }

                if let Some(on_response) = &self.callbacks.on_response {
                    self.guarded("response", || on_response(&message));
                }
            }

            match state.responses_remaining {
                Some(remaining) if remaining_changed && remaining <= 0 => {
                    self.finish(&mut state, EndReason::AllResponsesReceived)
                }
                _ => return,
            }
        };

        self.complete(end).await;
    }
}

fn cancel_timers(state: &mut CollectorState) {
    for timer in state.ack_timer.take().into_iter().chain(state.response_timer.take()) {
        timer.handle.cancel();
    }
}

/// Collectors are resolved by correlation id and receive every reply of their conversation
#[async_trait]
impl MessageHandler for Collector {
    async fn handle_message(&self, message: Message) -> EmptyResult {
        self.process(message).await;
        Ok(())
    }
}
