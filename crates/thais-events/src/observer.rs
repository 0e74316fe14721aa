use crate::{CallbackFault, EventFired};

/// Trait for components that want to hear about fired events.
///
/// Observers are invoked synchronously on the dispatch loop right after each
/// callback, in registration order. Keep them short: a slow observer delays
/// every event due after it.
pub trait EventObserver: Send + 'static {
    fn on_event_fired(&mut self, fired: &EventFired);

    fn on_callback_fault(&mut self, _fault: &CallbackFault) {}
}

/// Adapter so a plain closure can be registered as an observer
pub struct FnObserver<F>(pub F);

impl<F> EventObserver for FnObserver<F>
where
    F: FnMut(&EventFired) + Send + 'static,
{
    fn on_event_fired(&mut self, fired: &EventFired) {
        (self.0)(fired)
    }
}
