// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller surface the harness drives devices through.
//!
//! A controller accepts configuration documents for a device and relays the
//! device's telemetry back as three independent streams. The harness never
//! speaks the controller's wire protocol itself; it goes through the traits
//! here.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use edge_api_types::telemetry::{
    InfoMsg, LogItem, MetricMsg, Telemetry, TelemetryClass,
};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// The stream has ended. No further messages will be delivered on it.
    #[error("{class} stream for device {device} is closed")]
    StreamClosed { device: Uuid, class: TelemetryClass },

    #[error("controller transport error: {0}")]
    Transport(String),
}

/// Accepts and returns device configuration documents.
#[async_trait]
pub trait ConfigEndpoint: Send + Sync {
    async fn config_set(
        &self,
        device: Uuid,
        config: Vec<u8>,
    ) -> Result<(), ControllerError>;

    async fn config_get(&self, device: Uuid) -> Result<Vec<u8>, ControllerError>;
}

/// Blocking reads of a device's telemetry streams.
///
/// Each call returns the next message on the stream, waiting for one to
/// arrive if necessary, or [`ControllerError::StreamClosed`] once the stream
/// has ended.
#[async_trait]
pub trait TelemetryStreams: Send + Sync {
    async fn next_info(&self, device: Uuid) -> Result<InfoMsg, ControllerError>;
    async fn next_log(&self, device: Uuid) -> Result<LogItem, ControllerError>;
    async fn next_metric(
        &self,
        device: Uuid,
    ) -> Result<MetricMsg, ControllerError>;

    async fn next(
        &self,
        device: Uuid,
        class: TelemetryClass,
    ) -> Result<Telemetry, ControllerError> {
        Ok(match class {
            TelemetryClass::Info => Telemetry::Info(self.next_info(device).await?),
            TelemetryClass::Log => Telemetry::Log(self.next_log(device).await?),
            TelemetryClass::Metric => {
                Telemetry::Metric(self.next_metric(device).await?)
            }
        })
    }
}

struct Stream {
    tx: Option<mpsc::UnboundedSender<Telemetry>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Telemetry>>>,
}

impl Stream {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx: Some(tx), rx: Arc::new(tokio::sync::Mutex::new(rx)) }
    }
}

/// An in-memory controller.
///
/// Configuration documents are kept per device. Telemetry is whatever has
/// been [`publish`](MockController::publish)ed, delivered in order per
/// stream.
#[derive(Default)]
pub struct MockController {
    configs: Mutex<BTreeMap<Uuid, Vec<u8>>>,
    streams: Mutex<BTreeMap<(Uuid, TelemetryClass), Stream>>,
    config_sets: AtomicUsize,
    refuse_sets: AtomicUsize,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `msg` on the device's stream for the message's class.
    pub fn publish(&self, device: Uuid, msg: Telemetry) {
        let mut streams = self.streams.lock().unwrap();
        let stream =
            streams.entry((device, msg.class())).or_insert_with(Stream::new);
        if let Some(tx) = &stream.tx {
            // The receiver lives alongside the sender, so this cannot fail.
            let _ = tx.send(msg);
        }
    }

    /// Ends a stream. Messages already queued are still delivered.
    pub fn close(&self, device: Uuid, class: TelemetryClass) {
        let mut streams = self.streams.lock().unwrap();
        streams.entry((device, class)).or_insert_with(Stream::new).tx = None;
    }

    /// The number of `config_set` calls that were accepted.
    pub fn config_sets(&self) -> usize {
        self.config_sets.load(Ordering::Acquire)
    }

    /// Makes the next `count` calls to `config_set` fail with a transport
    /// error.
    pub fn refuse_config_sets(&self, count: usize) {
        self.refuse_sets.store(count, Ordering::Release);
    }

    async fn recv(
        &self,
        device: Uuid,
        class: TelemetryClass,
    ) -> Result<Telemetry, ControllerError> {
        let rx = {
            let mut streams = self.streams.lock().unwrap();
            streams.entry((device, class)).or_insert_with(Stream::new).rx.clone()
        };
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(ControllerError::StreamClosed { device, class })
    }
}

#[async_trait]
impl ConfigEndpoint for MockController {
    async fn config_set(
        &self,
        device: Uuid,
        config: Vec<u8>,
    ) -> Result<(), ControllerError> {
        let refused = self
            .refuse_sets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ControllerError::Transport(format!(
                "config for {device} refused"
            )));
        }

        self.configs.lock().unwrap().insert(device, config);
        self.config_sets.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn config_get(&self, device: Uuid) -> Result<Vec<u8>, ControllerError> {
        self.configs.lock().unwrap().get(&device).cloned().ok_or_else(|| {
            ControllerError::Transport(format!("no config for device {device}"))
        })
    }
}

fn mismatched(device: Uuid, got: &Telemetry) -> ControllerError {
    ControllerError::Transport(format!(
        "device {device} delivered {} telemetry on the wrong stream",
        got.class()
    ))
}

#[async_trait]
impl TelemetryStreams for MockController {
    async fn next_info(&self, device: Uuid) -> Result<InfoMsg, ControllerError> {
        match self.recv(device, TelemetryClass::Info).await? {
            Telemetry::Info(msg) => Ok(msg),
            other => Err(mismatched(device, &other)),
        }
    }

    async fn next_log(&self, device: Uuid) -> Result<LogItem, ControllerError> {
        match self.recv(device, TelemetryClass::Log).await? {
            Telemetry::Log(item) => Ok(item),
            other => Err(mismatched(device, &other)),
        }
    }

    async fn next_metric(
        &self,
        device: Uuid,
    ) -> Result<MetricMsg, ControllerError> {
        match self.recv(device, TelemetryClass::Metric).await? {
            Telemetry::Metric(msg) => Ok(msg),
            other => Err(mismatched(device, &other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    fn log(content: &str) -> Telemetry {
        Telemetry::Log(LogItem {
            source: "test".into(),
            severity: "info".into(),
            content: content.into(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn streams_deliver_in_order_then_close() {
        let ctl = MockController::new();
        let dev = Uuid::new_v4();
        ctl.publish(dev, log("one"));
        ctl.publish(dev, log("two"));
        ctl.close(dev, TelemetryClass::Log);

        assert_eq!(ctl.next_log(dev).await.unwrap().content, "one");
        assert_eq!(
            ctl.next(dev, TelemetryClass::Log).await.unwrap().as_log().unwrap().content,
            "two"
        );
        assert!(matches!(
            ctl.next_log(dev).await,
            Err(ControllerError::StreamClosed { class: TelemetryClass::Log, .. })
        ));
    }

    #[tokio::test]
    async fn refused_config_sets_are_not_stored() {
        let ctl = MockController::new();
        let dev = Uuid::new_v4();
        ctl.refuse_config_sets(1);

        assert!(ctl.config_set(dev, b"{}".to_vec()).await.is_err());
        assert!(ctl.config_get(dev).await.is_err());
        ctl.config_set(dev, b"{}".to_vec()).await.unwrap();
        assert_eq!(ctl.config_get(dev).await.unwrap(), b"{}");
        assert_eq!(ctl.config_sets(), 1);
    }
}
