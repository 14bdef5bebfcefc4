//! Advertisement pump
//! Forwards advertisements from the transport watcher to a handler until the
//! scan subscription is cancelled or the watcher stream ends.

use log::{debug, info};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::subscription::Subscription;
use crate::core::bluetooth::types::Advertisement;

pub struct BluetoothScanner;

impl BluetoothScanner {
    /// Starts pumping `advertisements` into `on_advertisement`. `on_ended`
    /// runs if the watcher stream ends without the subscription being
    /// cancelled.
    pub fn start_scan<F, E>(
        advertisements: UnboundedReceiver<Advertisement>,
        on_advertisement: F,
        on_ended: E,
    ) -> Subscription
    where
        F: Fn(Advertisement) -> bool + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        info!("Device scan task started.");
        Subscription::spawn(move |cancel_token| {
            Self::internal_scan_task(advertisements, on_advertisement, on_ended, cancel_token)
        })
    }

    async fn internal_scan_task<F, E>(
        mut advertisements: UnboundedReceiver<Advertisement>,
        on_advertisement: F,
        on_ended: E,
        cancel_token: CancellationToken,
    ) where
        F: Fn(Advertisement) -> bool + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let stream_ended = loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    debug!("Scan task cancelled.");
                    break false;
                }
                result = advertisements.recv() => match result {
                    Some(advertisement) => {
                        debug!("Found device - Address: {}, RSSI: {:?}", advertisement.address, advertisement.rssi);
                        if !on_advertisement(advertisement) {
                            debug!("Advertisement handler is gone, stopping scan task.");
                            break false;
                        }
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break true;
                    }
                }
            }
        };
        if stream_ended {
            on_ended();
        }
    }
}
