use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rss_common::config::CongestionConfig;
use rss_common::UserIdentifier;

use crate::congestion::{BufferStatusWindow, CongestionController, PendingBytes};

struct FakePending(AtomicU64);

impl FakePending {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(0)))
    }

    fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl PendingBytes for FakePending {
    fn total_pending_bytes(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn watermark_config() -> CongestionConfig {
    // Large sample window so test runtime never ages buckets out.
    CongestionConfig {
        sample_window_secs: 10,
        high_watermark: 1000,
        low_watermark: 500,
        user_inflow_high: u64::MAX,
        user_inflow_low: u64::MAX,
        worker_inflow_high: u64::MAX,
        worker_inflow_low: u64::MAX,
        user_inactive_ms: 2_000,
        check_interval_ms: u64::MAX >> 1,
    }
}

#[test]
fn window_accumulates_and_prunes() {
    let window = BufferStatusWindow::new(10);
    assert_eq!(window.sum(), 0);
    assert_eq!(window.bytes_per_sec(), 0);
    window.add(300);
    window.add(200);
    assert_eq!(window.sum(), 500);
    assert_eq!(window.bytes_per_sec(), 500);
}

#[test]
fn rate_averages_over_spanned_seconds() {
    let window = BufferStatusWindow::new(10);
    window.add(600);
    std::thread::sleep(Duration::from_millis(1100));
    window.add(100);
    // 700 bytes over two spanned seconds.
    assert_eq!(window.bytes_per_sec(), 350);
}

#[test]
fn single_user_congests_on_high_watermark() {
    let pending = FakePending::new();
    let controller = CongestionController::new(watermark_config(), pending.clone());
    let user = UserIdentifier::new("test", "rss");

    assert!(!controller.is_user_congested(&user));

    controller.produce_bytes(&user, 1001);
    pending.set(1001);
    controller.check_congestion();
    assert!(controller.is_user_congested(&user));

    pending.set(0);
    controller.check_congestion();
    assert!(!controller.is_user_congested(&user));
}

#[test]
fn only_users_over_average_rate_are_flagged() {
    let pending = FakePending::new();
    let controller = CongestionController::new(watermark_config(), pending.clone());
    let user1 = UserIdentifier::new("test", "heavy");
    let user2 = UserIdentifier::new("test", "light");

    assert!(!controller.is_user_congested(&user1));
    assert!(!controller.is_user_congested(&user2));

    // Average produce rate is (800 + 201) / 2 users; only user1 exceeds it.
    controller.produce_bytes(&user1, 800);
    controller.produce_bytes(&user2, 201);
    pending.set(1001);
    controller.check_congestion();
    assert!(controller.is_user_congested(&user1));
    assert!(!controller.is_user_congested(&user2));

    // Both at the same rate: both flagged.
    controller.produce_bytes(&user1, 800);
    controller.produce_bytes(&user2, 1399);
    pending.set(1600);
    controller.check_congestion();
    assert!(controller.is_user_congested(&user1));
    assert!(controller.is_user_congested(&user2));

    // Under the low watermark everything clears.
    pending.set(0);
    controller.check_congestion();
    assert!(!controller.is_user_congested(&user1));
    assert!(!controller.is_user_congested(&user2));
}

#[test]
fn user_level_traffic_quota_caps_heavy_producer() {
    let pending = FakePending::new();
    let config = CongestionConfig {
        sample_window_secs: 10,
        high_watermark: 100_000,
        low_watermark: 50_000,
        user_inflow_high: 500,
        user_inflow_low: 400,
        worker_inflow_high: 1_200,
        worker_inflow_low: 1_000,
        user_inactive_ms: 120_000,
        check_interval_ms: u64::MAX >> 1,
    };
    let controller = CongestionController::new(config, pending.clone());
    let user = UserIdentifier::new("tenant", "heavy");

    assert!(!controller.is_user_congested(&user));
    controller.produce_bytes(&user, 600);
    // 600 bytes/s exceeds the 500 cap.
    assert!(controller.is_user_congested(&user));

    std::thread::sleep(Duration::from_millis(1100));
    controller.produce_bytes(&user, 100);
    // 700 bytes over two seconds is 350/s, under the 400 release threshold.
    assert!(!controller.is_user_congested(&user));
}

#[test]
fn worker_level_traffic_quota_flags_above_average_users() {
    let pending = FakePending::new();
    let config = CongestionConfig {
        sample_window_secs: 10,
        high_watermark: 100_000,
        low_watermark: 50_000,
        user_inflow_high: u64::MAX,
        user_inflow_low: u64::MAX,
        worker_inflow_high: 800,
        worker_inflow_low: 700,
        user_inactive_ms: 120_000,
        check_interval_ms: u64::MAX >> 1,
    };
    let controller = CongestionController::new(config, pending.clone());
    let user1 = UserIdentifier::new("tenant", "big");
    let user2 = UserIdentifier::new("tenant", "small");

    controller.produce_bytes(&user1, 500);
    controller.produce_bytes(&user2, 400);
    // Worker total of 900/s passes the 800 cap; user1 sits above the
    // 450/s per-user average, user2 below it.
    controller.check_congestion();
    assert!(controller.is_user_congested(&user1));
    assert!(!controller.is_user_congested(&user2));
}

#[test]
fn inactive_users_are_evicted() {
    let pending = FakePending::new();
    let mut config = watermark_config();
    config.user_inactive_ms = 50;
    let controller = CongestionController::new(config, pending);
    let user = UserIdentifier::new("tenant", "sleepy");

    controller.produce_bytes(&user, 100);
    assert_eq!(controller.tracked_users(), 1);

    std::thread::sleep(Duration::from_millis(120));
    controller.evict_inactive();
    assert_eq!(controller.tracked_users(), 0);
}
