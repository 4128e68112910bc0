//! Rolling statistics windows and diagnostic snapshots.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use serde::Serialize;

fn monotonic_secs() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs()
}

struct Bucket {
    second: u64,
    count: u64,
    sum: u64,
}

/// Event accumulator over a sliding time window, bucketed per second.
///
/// Tracks both an event count (loss counters) and a value average (query
/// latency in milliseconds).
pub struct RollingStat {
    window_secs: u64,
    buckets: Mutex<VecDeque<Bucket>>,
}

impl RollingStat {
    pub fn new(window_secs: u64) -> RollingStat {
        RollingStat {
            window_secs,
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, value: u64) {
        let now = monotonic_secs();
        let mut buckets = self.buckets.lock().unwrap();
        Self::prune(&mut buckets, now, self.window_secs);
        match buckets.back_mut() {
            Some(bucket) if bucket.second == now => {
                bucket.count += 1;
                bucket.sum += value;
            }
            _ => buckets.push_back(Bucket {
                second: now,
                count: 1,
                sum: value,
            }),
        }
    }

    /// Events recorded within the window.
    pub fn count(&self) -> u64 {
        let now = monotonic_secs();
        let mut buckets = self.buckets.lock().unwrap();
        Self::prune(&mut buckets, now, self.window_secs);
        buckets.iter().map(|b| b.count).sum()
    }

    /// Average recorded value within the window, zero when empty.
    pub fn avg(&self) -> u64 {
        let now = monotonic_secs();
        let mut buckets = self.buckets.lock().unwrap();
        Self::prune(&mut buckets, now, self.window_secs);
        let (count, sum) = buckets
            .iter()
            .fold((0u64, 0u64), |(c, s), b| (c + b.count, s + b.sum));
        if count == 0 {
            0
        } else {
            sum / count
        }
    }

    fn prune(buckets: &mut VecDeque<Bucket>, now: u64, window: u64) {
        while let Some(front) = buckets.front() {
            if front.second + window <= now {
                buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Read-only per-server status (health, load, per-service counters).
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: u32,
    pub address: String,
    /// "active" or "failed"
    pub state: String,
    /// Fail transitions since startup.
    pub fail_count: u64,
    /// In-flight requests counted against the admission limit.
    pub request_count: usize,
    /// Requests waiting for an admission slot.
    pub queue_length: usize,
    pub auth: Option<ServiceStatus>,
    pub acct: Option<ServiceStatus>,
    pub interim: Option<ServiceStatus>,
}

/// Counters for one service type on one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub sent: u64,
    pub lost: u64,
    pub lost_5m: u64,
    pub lost_1m: u64,
    /// Average query time in milliseconds.
    pub query_avg_5m_ms: u64,
    pub query_avg_1m_ms: u64,
}

impl ServerStatus {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rolling_stat_count_and_avg() {
        let stat = RollingStat::new(60);
        assert_eq!(stat.count(), 0);
        assert_eq!(stat.avg(), 0);

        stat.add(10);
        stat.add(20);
        stat.add(30);
        assert_eq!(stat.count(), 3);
        assert_eq!(stat.avg(), 20);
    }

    #[test]
    fn test_rolling_stat_window_expiry() {
        let stat = RollingStat::new(1);
        stat.add(5);
        assert_eq!(stat.count(), 1);
        std::thread::sleep(Duration::from_millis(2100));
        assert_eq!(stat.count(), 0);
        assert_eq!(stat.avg(), 0);
    }

    #[test]
    fn test_server_status_json() {
        let status = ServerStatus {
            id: 1,
            address: "192.0.2.1".into(),
            state: "active".into(),
            fail_count: 0,
            request_count: 0,
            queue_length: 0,
            auth: None,
            acct: Some(ServiceStatus {
                sent: 4,
                lost: 1,
                lost_5m: 1,
                lost_1m: 1,
                query_avg_5m_ms: 12,
                query_avg_1m_ms: 12,
            }),
            interim: None,
        };
        let json = status.to_json().unwrap();
        assert!(json.contains("\"state\": \"active\""));
        assert!(json.contains("\"sent\": 4"));
    }
}
