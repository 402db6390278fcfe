// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages a device reports through its controller.
//!
//! A device publishes three independent streams: info (state changes of the
//! device and the objects configured on it), log lines, and periodic metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the three independent telemetry streams a device publishes.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum TelemetryClass {
    Info,
    Log,
    Metric,
}

/// A single message from any of a device's telemetry streams.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "class", rename_all = "lowercase")]
pub enum Telemetry {
    Info(InfoMsg),
    Log(LogItem),
    Metric(MetricMsg),
}

impl Telemetry {
    pub fn class(&self) -> TelemetryClass {
        match self {
            Telemetry::Info(_) => TelemetryClass::Info,
            Telemetry::Log(_) => TelemetryClass::Log,
            Telemetry::Metric(_) => TelemetryClass::Metric,
        }
    }

    pub fn as_info(&self) -> Option<&InfoMsg> {
        match self {
            Telemetry::Info(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_log(&self) -> Option<&LogItem> {
        match self {
            Telemetry::Log(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_metric(&self) -> Option<&MetricMsg> {
        match self {
            Telemetry::Metric(msg) => Some(msg),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct InfoMsg {
    pub device_id: Uuid,
    pub at_time: DateTime<Utc>,
    pub payload: InfoPayload,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppRunState {
    Unknown,
    Downloading,
    Installed,
    Booting,
    Running,
    Halting,
    Halted,
    Error,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum InfoPayload {
    Device {
        last_reboot_time: Option<DateTime<Utc>>,
        last_reboot_reason: String,
    },
    App {
        id: String,
        name: String,
        state: AppRunState,
        errors: Vec<String>,
    },
    NetworkInstance {
        id: String,
        name: String,
        activated: bool,
        errors: Vec<String>,
    },
    Volume {
        id: String,
        name: String,
        progress_percent: u8,
    },
    ContentTree {
        id: String,
        name: String,
        progress_percent: u8,
    },
    Snapshot {
        id: String,
        name: String,
        volume_id: String,
        created: bool,
        deleted: bool,
        rollback_time_last_op: Option<DateTime<Utc>>,
        error: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LogItem {
    pub source: String,
    pub severity: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NetworkMetric {
    pub network_id: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MetricMsg {
    pub device_id: Uuid,
    pub at_time: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_used_mib: u64,
    pub networks: Vec<NetworkMetric>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn telemetry_is_tagged_by_class() {
        let item = Telemetry::Log(LogItem {
            source: "pillar".to_owned(),
            severity: "info".to_owned(),
            content: "hello".to_owned(),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["class"], "log");
        assert_eq!(item.class(), TelemetryClass::Log);
        assert!(item.as_info().is_none());
        assert_eq!(TelemetryClass::Metric.to_string(), "metric");
    }
}
