//! Notification handling for the heart-rate sensor
//! This module pumps value-changed and connection-status events from a live
//! connection to their consumers.

use std::future::Future;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::core::bluetooth::events::EventSink;
use crate::core::bluetooth::subscription::Subscription;
use crate::core::bluetooth::types::ConnectionStatus;

/// Extracts the heart-rate value from a Heart Rate Measurement payload
pub fn decode_heart_rate(value: &[u8]) -> Option<u8> {
    value.get(1).copied()
}

/// Notification handler for heart-rate data
#[derive(Clone)]
pub struct NotificationHandler {
    sink: Arc<dyn EventSink>,
}

impl NotificationHandler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Starts forwarding decoded samples from `values` to the sink
    pub fn setup_notifications(&self, mut values: UnboundedReceiver<Vec<u8>>, address: String) -> Subscription {
        let sink = self.sink.clone();
        Subscription::spawn(move |cancel_token| async move {
            info!("Listening for heartrate notifications from {}", address);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    value = values.recv() => match value {
                        Some(value) => match decode_heart_rate(&value) {
                            Some(bpm) => {
                                debug!("Invoking heartrate update with data {}", bpm);
                                sink.on_heart_rate_sample(bpm);
                            }
                            None => debug!("Ignoring short heartrate payload: {:?}", value),
                        },
                        None => break,
                    }
                }
            }
            info!("Notification stream ended");
        })
    }
}

/// Watches a device's link status and runs `on_disconnected` once when the
/// link drops. The callback is spawned so that it may tear down this very
/// subscription.
pub fn watch_connection_status<F, Fut>(mut status: UnboundedReceiver<ConnectionStatus>, on_disconnected: F) -> Subscription
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut on_disconnected = Some(on_disconnected);
    Subscription::spawn(move |cancel_token| async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return,
                change = status.recv() => match change {
                    Some(ConnectionStatus::Disconnected) => {
                        debug!("Device connection status changed to Disconnected");
                        if let Some(callback) = on_disconnected.take() {
                            tokio::spawn(callback());
                        }
                        return;
                    }
                    Some(ConnectionStatus::Connected) => {
                        debug!("Device connection status changed to Connected");
                    }
                    None => return,
                }
            }
        }
    })
}
