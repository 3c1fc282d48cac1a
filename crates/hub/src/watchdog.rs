//! Liveness oracle: components report heartbeats, callers ask which ones
//! have gone quiet. The watchdog never acts on what it sees.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// `None` for components registered but never heard from.
    pub last_heartbeat: Option<Instant>,
    pub status: ComponentStatus,
    pub message: String,
    pub heartbeat_count: u64,
    /// Per-component threshold that overrides the caller's.
    pub stale_after: Option<Duration>,
}

/// Serializable view of one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub name: String,
    pub status: ComponentStatus,
    pub message: String,
    pub heartbeat_count: u64,
    pub seconds_since_heartbeat: Option<u64>,
}

#[derive(Default)]
pub struct Watchdog {
    components: Mutex<HashMap<String, ComponentInfo>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a component with its own staleness threshold. It counts
    /// as stale until its first heartbeat.
    pub fn register(&self, name: &str, stale_after: Duration) {
        let mut map = self.components.lock();
        map.entry(name.to_string())
            .and_modify(|c| c.stale_after = Some(stale_after))
            .or_insert(ComponentInfo {
                last_heartbeat: None,
                status: ComponentStatus::Ok,
                message: String::new(),
                heartbeat_count: 0,
                stale_after: Some(stale_after),
            });
    }

    pub fn heartbeat(&self, name: &str, status: ComponentStatus, message: &str) {
        let now = Instant::now();
        let mut map = self.components.lock();
        let entry = map.entry(name.to_string()).or_insert(ComponentInfo {
            last_heartbeat: None,
            status,
            message: String::new(),
            heartbeat_count: 0,
            stale_after: None,
        });
        entry.last_heartbeat = Some(now);
        entry.status = status;
        entry.message = message.to_string();
        entry.heartbeat_count += 1;
    }

    /// Names whose last heartbeat is older than their threshold (their own,
    /// if registered with one, else `threshold`), or that never reported.
    pub fn get_stale(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let map = self.components.lock();
        let mut stale: Vec<String> = map
            .iter()
            .filter(|(_, c)| match c.last_heartbeat {
                None => true,
                Some(t) => now.duration_since(t) > c.stale_after.unwrap_or(threshold),
            })
            .map(|(name, _)| name.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn snapshot(&self) -> Vec<ComponentReport> {
        let now = Instant::now();
        let map = self.components.lock();
        let mut out: Vec<ComponentReport> = map
            .iter()
            .map(|(name, c)| ComponentReport {
                name: name.clone(),
                status: c.status,
                message: c.message.clone(),
                heartbeat_count: c.heartbeat_count,
                seconds_since_heartbeat: c.last_heartbeat.map(|t| now.duration_since(t).as_secs()),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_heartbeat_creates_component() {
        let w = Watchdog::new();
        w.heartbeat("sensor_loop", ComponentStatus::Ok, "polled");
        let c = &w.snapshot()[0];
        assert_eq!(c.name, "sensor_loop");
        assert_eq!(c.heartbeat_count, 1);
        assert_eq!(c.message, "polled");
        assert_eq!(c.seconds_since_heartbeat, Some(0));
    }

    #[test]
    fn heartbeats_accumulate_and_update_status() {
        let w = Watchdog::new();
        w.heartbeat("x", ComponentStatus::Ok, "");
        w.heartbeat("x", ComponentStatus::Degraded, "slow");
        let c = &w.snapshot()[0];
        assert_eq!(c.heartbeat_count, 2);
        assert_eq!(c.status, ComponentStatus::Degraded);
    }

    #[test]
    fn registered_but_silent_component_is_stale() {
        let w = Watchdog::new();
        w.register("light_watchdog", Duration::from_secs(600));
        assert_eq!(w.get_stale(Duration::from_secs(60)), vec!["light_watchdog"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_after_threshold_elapses() {
        let w = Watchdog::new();
        w.heartbeat("a", ComponentStatus::Ok, "");
        w.heartbeat("b", ComponentStatus::Ok, "");
        tokio::time::advance(Duration::from_secs(30)).await;
        w.heartbeat("b", ComponentStatus::Ok, "");
        tokio::time::advance(Duration::from_secs(40)).await;

        assert_eq!(w.get_stale(Duration::from_secs(60)), vec!["a"]);
        assert!(w.get_stale(Duration::from_secs(120)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn registered_threshold_overrides_caller() {
        let w = Watchdog::new();
        w.register("slow_loop", Duration::from_secs(600));
        w.heartbeat("slow_loop", ComponentStatus::Ok, "");
        w.heartbeat("fast_loop", ComponentStatus::Ok, "");
        tokio::time::advance(Duration::from_secs(120)).await;

        assert_eq!(w.get_stale(Duration::from_secs(60)), vec!["fast_loop"]);
    }

    #[test]
    fn concurrent_heartbeats_are_all_counted() {
        let w = std::sync::Arc::new(Watchdog::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let w = std::sync::Arc::clone(&w);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        w.heartbeat(&format!("c{}", i % 2), ComponentStatus::Ok, "");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total: u64 = w.snapshot().iter().map(|c| c.heartbeat_count).sum();
        assert_eq!(total, 800);
    }
}
