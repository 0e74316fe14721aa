use std::time::Duration;

use thais_events::{CallbackFault, EventFired, EventObserver, FaultKind};
use tracing::{debug, error, warn};

/// Observer that logs every fired event and callback fault
#[derive(Debug)]
pub struct LoggingObserver {
    /// Fired events later than this are logged as warnings
    late_warning: Duration,
}

impl LoggingObserver {
    pub fn new() -> Self {
        Self {
            late_warning: Duration::from_millis(100),
        }
    }

    pub fn warn_when_later_than(mut self, late_warning: Duration) -> Self {
        self.late_warning = late_warning;
        self
    }
}

impl Default for LoggingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl EventObserver for LoggingObserver {
    fn on_event_fired(&mut self, fired: &EventFired) {
        let label = fired.label.as_deref().unwrap_or("-");
        let lateness = fired.lateness();
        if lateness > self.late_warning {
            warn!(
                target: "events",
                "{} ({}) fired {}ms late at {}",
                fired.id,
                label,
                lateness.as_millis(),
                fired.fired_at
            );
            return;
        }

        match fired.origin {
            Some(origin) => debug!(
                target: "events",
                "{} ({}) fired at {} for {}", fired.id, label, fired.fired_at, origin
            ),
            None => debug!(target: "events", "{} ({}) fired at {}", fired.id, label, fired.fired_at),
        }
    }

    fn on_callback_fault(&mut self, fault: &CallbackFault) {
        match &fault.kind {
            FaultKind::Panicked(_) => error!(target: "events", "{}", fault),
            FaultKind::Failed(_) => warn!(target: "events", "{}", fault),
        }
    }
}
