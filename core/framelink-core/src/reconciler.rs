use crate::throughput::ThroughputSample;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

/// Depth of the trailing result window.
pub const TRAILING_WINDOW_DEPTH: usize = 3;

/// One recognized object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "class_Id", alias = "classId")]
    pub class_id: i64,
    #[serde(default, alias = "className", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub confidence: f32,
}

impl Detection {
    pub fn label(&self) -> String {
        match &self.class_name {
            Some(name) => name.clone(),
            None => format!("Class {}", self.class_id),
        }
    }
}

/// An annotated frame and the detections drawn on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundResult {
    /// Displayable image reference, typically a data URL.
    pub frame: String,
    pub detections: Vec<Detection>,
    /// Echoed sequence of the frame this result answers, when the service sends one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Displayed,
    /// Dropped because a newer sequence is already displayed.
    Stale { sequence: u64, displayed: u64 },
}

/// FIFO of the most recent results; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct ResultWindow {
    depth: usize,
    entries: VecDeque<Arc<InboundResult>>,
}

impl ResultWindow {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            entries: VecDeque::with_capacity(depth),
        }
    }

    pub fn push(&mut self, result: Arc<InboundResult>) {
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<InboundResult>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Merges inbound results into display state.
///
/// The displayed frame and its detections live in one `Arc`, so a reader
/// always sees a matching pair. The received-rate sample counts every result
/// that arrives, including stale ones.
#[derive(Debug)]
pub struct ResultReconciler {
    current: Option<Arc<InboundResult>>,
    window: ResultWindow,
    received: ThroughputSample,
    drop_stale: bool,
    stale_dropped: u64,
    last_service_error: Option<String>,
}

impl ResultReconciler {
    pub fn new(window_depth: usize, drop_stale: bool) -> Self {
        Self {
            current: None,
            window: ResultWindow::new(window_depth),
            received: ThroughputSample::per_second(),
            drop_stale,
            stale_dropped: 0,
            last_service_error: None,
        }
    }

    pub fn apply(&mut self, result: InboundResult, now: Instant) -> ApplyOutcome {
        self.received.record(now);

        if self.drop_stale {
            let displayed = self.current.as_ref().and_then(|current| current.sequence);
            if let (Some(sequence), Some(displayed)) = (result.sequence, displayed) {
                if sequence <= displayed {
                    self.stale_dropped += 1;
                    return ApplyOutcome::Stale {
                        sequence,
                        displayed,
                    };
                }
            }
        }

        let result = Arc::new(result);
        self.window.push(result.clone());
        self.current = Some(result);
        self.last_service_error = None;
        ApplyOutcome::Displayed
    }

    pub fn current(&self) -> Option<Arc<InboundResult>> {
        self.current.clone()
    }

    pub fn window(&self) -> &ResultWindow {
        &self.window
    }

    pub fn record_service_error(&mut self, message: String) {
        self.last_service_error = Some(message);
    }

    pub fn last_service_error(&self) -> Option<&str> {
        self.last_service_error.as_deref()
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn roll_throughput(&mut self, now: Instant) {
        self.received.roll(now);
    }

    pub fn received_rate(&self) -> u32 {
        self.received.rate()
    }

    /// Empties the displayed result and the trailing window.
    pub fn clear(&mut self) {
        self.current = None;
        self.window.clear();
        self.last_service_error = None;
    }
}

impl Default for ResultReconciler {
    fn default() -> Self {
        Self::new(TRAILING_WINDOW_DEPTH, false)
    }
}
