use crate::graph::Relationship;
use chrono::DateTime;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct LastSeen {
    request_id: String,
    timestamp: String,
}

/// Process-wide table of each identified user's most recent request,
/// used to chain requests into a per-user temporal sequence.
///
/// `advance` performs the lookup and the overwrite inside one critical
/// section, so two concurrent requests from the same user can never
/// observe each other as predecessor or drop a link in the chain.
#[derive(Default)]
pub struct TemporalSequencer {
    last_request: Mutex<HashMap<String, LastSeen>>,
}

impl TemporalSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current request for `user_id` and, when a previous
    /// request exists, return the FOLLOWS relationship between the two.
    /// The edge always points from the earlier timestamp to the later
    /// one, so two near-simultaneous requests racing on the same user
    /// cannot produce a reversed edge; with missing or unparsable
    /// timestamps arrival order decides and the delta is zero.
    pub fn advance(
        &self,
        user_id: &str,
        request_id: &str,
        timestamp: &str,
    ) -> Option<Relationship> {
        if user_id.is_empty() {
            return None;
        }

        let mut table = self.last_request.lock().unwrap();
        let Some(previous) = table.get(user_id).cloned() else {
            table.insert(
                user_id.to_string(),
                LastSeen {
                    request_id: request_id.to_string(),
                    timestamp: timestamp.to_string(),
                },
            );
            return None;
        };

        let time_delta = seconds_between(&previous.timestamp, timestamp);
        if time_delta < 0 {
            // The new request is older than the stored one; it becomes
            // the predecessor and the stored entry stays current.
            return Some(
                Relationship::new(request_id, &previous.request_id, "FOLLOWS")
                    .prop("time_delta", -time_delta)
                    .prop("request_sequence", "next"),
            );
        }

        table.insert(
            user_id.to_string(),
            LastSeen {
                request_id: request_id.to_string(),
                timestamp: timestamp.to_string(),
            },
        );
        Some(
            Relationship::new(&previous.request_id, request_id, "FOLLOWS")
                .prop("time_delta", time_delta)
                .prop("request_sequence", "next"),
        )
    }

    pub fn tracked_users(&self) -> usize {
        self.last_request.lock().unwrap().len()
    }
}

fn seconds_between(earlier: &str, later: &str) -> i64 {
    match (
        DateTime::parse_from_rfc3339(earlier),
        DateTime::parse_from_rfc3339(later),
    ) {
        (Ok(prev), Ok(curr)) => (curr - prev).num_seconds(),
        _ => 0,
    }
}
