//! Utilities for publishing Kubernetes events
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the reconciliation
//! that triggered it.
use std::error::Error;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

/// Maximum size of an event note in bytes.
const MAX_NOTE_LENGTH: usize = 1024;

/// Well-known event reasons, shown in the REASON column of `kubectl get events`.
pub mod reasons {
    pub const CREATED_DEPLOYMENT: &str = "CreatedDeployment";
    pub const UPDATED_DEPLOYMENT: &str = "UpdatedDeployment";
}

/// Publishes events regarding a single object, usually the owner of the reconciled resources.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, type_: EventType, reason: &str, note: String);
}

/// Publishes events through a [`kube::runtime::events::Recorder`].
pub struct KubeEventPublisher {
    recorder: Recorder,
    regarding: ObjectReference,
}

impl KubeEventPublisher {
    pub fn new(client: kube::Client, controller_name: &str, regarding: ObjectReference) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
            regarding,
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    #[tracing::instrument(skip(self, note))]
    async fn publish(&self, type_: EventType, reason: &str, mut note: String) {
        message::truncate_with_ellipsis(&mut note, MAX_NOTE_LENGTH);
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &self.regarding).await {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Renders an error and all of its sources as a single line, e.g. `a failed: b failed: reason`.
pub fn error_chain_message(err: &dyn Error) -> String {
    let mut buf = err.to_string();
    let mut err = err;
    while let Some(source) = err.source() {
        buf.push_str(": ");
        buf.push_str(&source.to_string());
        err = source;
    }
    buf
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();
        let len = msg.len();
        if len > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    fn find_start_of_char(s: &str, mut pos: usize) -> usize {
        while !s.is_char_boundary(pos) {
            pos = pos.saturating_sub(1);
        }
        pos
    }

}
