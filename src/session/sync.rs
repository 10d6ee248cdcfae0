// Node context - hardware sync device and notification listeners
//
// Passed into `CaptureNode::new`; the node holds no other handle to the
// outside world.

use std::sync::Arc;

/// Device emitting the trigger pulse train shared by synchronized cameras
pub trait HardwareSync: Send + Sync {
    /// Device path or name, for logs
    fn port(&self) -> String;

    /// Start (or restart) the pulse train. With `external` the device follows
    /// an external trigger input instead of its own clock.
    fn start(&self, framerate: f64, pulse_duration_us: u32, external: bool);

    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Receives session events, e.g. to relay them to a control server
pub trait NotificationListener: Send + Sync {
    fn change_state(&self, state: &str);

    fn receive_message(&self, _message: &str) {}
}

#[derive(Clone, Default)]
pub struct NodeContext {
    pub sync: Option<Arc<dyn HardwareSync>>,
    pub listeners: Vec<Arc<dyn NotificationListener>>,
}

impl NodeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync(mut self, sync: Arc<dyn HardwareSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn NotificationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub(crate) fn notify_state(&self, state: &str) {
        for listener in &self.listeners {
            listener.change_state(state);
        }
    }

    pub(crate) fn notify_message(&self, message: &str) {
        for listener in &self.listeners {
            listener.receive_message(message);
        }
    }
}

/// Listener that forwards events to the log
pub struct LogListener;

impl NotificationListener for LogListener {
    fn change_state(&self, state: &str) {
        log::info!("STATUS> {}", state);
    }

    fn receive_message(&self, message: &str) {
        log::info!("MESSAGE> {}", message);
    }
}

/// Listener that keeps every event it receives
#[derive(Default)]
pub struct CollectingListener {
    pub states: parking_lot::Mutex<Vec<String>>,
    pub messages: parking_lot::Mutex<Vec<String>>,
}

impl NotificationListener for CollectingListener {
    fn change_state(&self, state: &str) {
        self.states.lock().push(state.to_string());
    }

    fn receive_message(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}
