// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stock predicates for the conditions tests most often wait on.

use chrono::{DateTime, Utc};
use edge_api_types::telemetry::{AppRunState, InfoPayload, Telemetry};
use regex::Regex;

use super::Predicate;

/// Matches once the device has reported `count` reboots after the first
/// device info message seen.
pub fn reboot_count(count: usize) -> impl Predicate {
    let mut last: Option<Option<DateTime<Utc>>> = None;
    let mut seen = 0;

    move |msg: &Telemetry| {
        let Some(InfoPayload::Device { last_reboot_time, .. }) =
            msg.as_info().map(|i| &i.payload)
        else {
            return false;
        };

        if last.is_some_and(|prev| prev != *last_reboot_time) {
            seen += 1;
        }
        last = Some(*last_reboot_time);
        seen >= count
    }
}

/// Matches an info message reporting app `name` in `state`.
pub fn app_state(name: &str, state: AppRunState) -> impl Predicate {
    let name = name.to_owned();
    move |msg: &Telemetry| {
        matches!(
            msg.as_info().map(|i| &i.payload),
            Some(InfoPayload::App { name: n, state: s, .. }) if *n == name && *s == state
        )
    }
}

/// Matches an info message reporting network instance `name` activated.
pub fn network_instance_activated(name: &str) -> impl Predicate {
    let name = name.to_owned();
    move |msg: &Telemetry| {
        matches!(
            msg.as_info().map(|i| &i.payload),
            Some(InfoPayload::NetworkInstance { name: n, activated: true, .. }) if *n == name
        )
    }
}

/// Matches a log line whose content matches `pattern`.
pub fn log_matches(pattern: &str) -> Result<impl Predicate, regex::Error> {
    let re = Regex::new(pattern)?;
    Ok(move |msg: &Telemetry| msg.as_log().is_some_and(|l| re.is_match(&l.content)))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use edge_api_types::telemetry::{InfoMsg, LogItem};
    use uuid::Uuid;

    fn info(payload: InfoPayload) -> Telemetry {
        Telemetry::Info(InfoMsg {
            device_id: Uuid::nil(),
            at_time: Utc::now(),
            payload,
        })
    }

    fn booted(secs: i64) -> Telemetry {
        info(InfoPayload::Device {
            last_reboot_time: Utc.timestamp_opt(secs, 0).single(),
            last_reboot_reason: "power".into(),
        })
    }

    #[test]
    fn reboots_are_counted_from_first_report() {
        let mut p = reboot_count(2);
        assert!(!p.evaluate(&booted(100)));
        assert!(!p.evaluate(&booted(100)));
        assert!(!p.evaluate(&booted(200)));
        assert!(!p.evaluate(&booted(200)));
        assert!(p.evaluate(&booted(300)));
    }

    #[test]
    fn app_and_network_states() {
        let mut running = app_state("nginx", AppRunState::Running);
        let msg = |name: &str, state| {
            info(InfoPayload::App {
                id: "x".into(),
                name: name.into(),
                state,
                errors: vec![],
            })
        };
        assert!(!running.evaluate(&msg("nginx", AppRunState::Booting)));
        assert!(!running.evaluate(&msg("redis", AppRunState::Running)));
        assert!(running.evaluate(&msg("nginx", AppRunState::Running)));

        let mut up = network_instance_activated("backend");
        let ni = |activated| {
            info(InfoPayload::NetworkInstance {
                id: "n".into(),
                name: "backend".into(),
                activated,
                errors: vec![],
            })
        };
        assert!(!up.evaluate(&ni(false)));
        assert!(up.evaluate(&ni(true)));
    }

    #[test]
    fn log_content_is_matched_by_pattern() {
        let mut p = log_matches(r"reboot\(\d+\)").unwrap();
        let line = |content: &str| {
            Telemetry::Log(LogItem {
                source: "zedbox".into(),
                severity: "info".into(),
                content: content.into(),
                timestamp: Utc::now(),
            })
        };
        assert!(!p.evaluate(&line("rebooting")));
        assert!(p.evaluate(&line("scheduled reboot(3)")));
        assert!(log_matches("(").is_err());
    }
}
