//! Tests for [`CacheWarmingService`]: scheduling, cycles, failure isolation,
//! the background loop and schedule optimization.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use muninn::types::Params;
use muninn::warming::{DataFetcher, WarmingOutcome, fetcher_fn};
use muninn::{
    CacheServices, ManagerConfig, Muninn, MuninnError, Result, ServiceType, WarmingConfig,
    WarmingPriority, WarmingSchedule,
};

// ============================================================================
// Mock fetchers
// ============================================================================

struct PanickingFetcher;

#[async_trait]
impl DataFetcher for PanickingFetcher {
    async fn fetch(&self, _region: &str, _params: Option<&Params>) -> Result<Value> {
        panic!("pricing feed returned garbage");
    }
}

fn static_fetcher(value: Value) -> Arc<dyn DataFetcher> {
    fetcher_fn(move |_region, _params| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

fn failing_fetcher(message: &'static str) -> Arc<dyn DataFetcher> {
    fetcher_fn(move |region, _params| async move {
        Err(MuninnError::fetch(region, message))
    })
}

/// Records `<label>:<region>` for every call.
fn recording_fetcher(log: Arc<Mutex<Vec<String>>>, label: &'static str) -> Arc<dyn DataFetcher> {
    fetcher_fn(move |region, _params| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(format!("{label}:{region}"));
            Ok(json!({ "region": region }))
        }
    })
}

/// Blocks until `release` is notified.
fn gated_fetcher(release: Arc<Notify>) -> Arc<dyn DataFetcher> {
    fetcher_fn(move |_region, _params| {
        let release = Arc::clone(&release);
        async move {
            release.notified().await;
            Ok(json!("released"))
        }
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn services_with(warming: WarmingConfig, manager: ManagerConfig) -> CacheServices {
    Muninn::builder()
        .default_schedules(false)
        .warming_config(warming)
        .manager_config(manager)
        .build()
        .unwrap()
}

fn services() -> CacheServices {
    services_with(
        WarmingConfig::new().pauses(Duration::ZERO, Duration::ZERO, Duration::ZERO),
        ManagerConfig::default(),
    )
}

fn schedule(
    provider: &str,
    service_type: ServiceType,
    region: &str,
    priority: WarmingPriority,
    minutes: u32,
) -> WarmingSchedule {
    WarmingSchedule::new(provider, service_type, region, priority, minutes)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn critical_compute_schedule_warms_the_cache() {
    let services = services();
    let warming = services.warming();
    let payload = json!({"services": [{"name": "t3.micro", "price": 0.0104}]});

    warming.register_fetcher("aws", ServiceType::Compute, static_fetcher(payload.clone()));
    let s = schedule("aws", ServiceType::Compute, "us-east-1", WarmingPriority::Critical, 30);
    let id = s.id();
    warming.add_schedule(s).unwrap();

    let report = warming.run_warming_cycle().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert!(!report.overlapped);

    let cached = services
        .manager()
        .get_cached_data("aws", ServiceType::Compute, "us-east-1", None, false)
        .await;
    assert_eq!(cached, Some(payload));

    let warmed = warming.schedule(&id).unwrap();
    assert_eq!(warmed.warming_count, 1);
    assert_eq!(warmed.error_count, 0);
    assert_eq!(warmed.last_outcome, Some(WarmingOutcome::Success));
    assert!(warmed.last_warmed.is_some());

    let entry = services.store().get(&id).await.unwrap();
    assert!(entry.tags.contains("priority:critical"));
    assert!(entry.tags.iter().any(|t| t.starts_with("warmed:")));
    assert!(entry.tags.contains("provider:aws"));
}

#[tokio::test]
async fn params_reach_the_fetcher_and_the_key() {
    let services = services();
    let warming = services.warming();
    warming.register_fetcher(
        "gcp",
        ServiceType::AiMl,
        fetcher_fn(|_region, params: Option<Params>| async move {
            Ok(json!({ "model": params.and_then(|p| p.get("model").cloned()) }))
        }),
    );
    let params = muninn::types::params([("model", "gemini-pro")]);
    warming
        .add_schedule(
            schedule("gcp", ServiceType::AiMl, "us-central1", WarmingPriority::Medium, 240)
                .with_params(params.clone()),
        )
        .unwrap();

    warming.run_warming_cycle().await;

    let cached = services
        .manager()
        .get_cached_data("gcp", ServiceType::AiMl, "us-central1", Some(&params), false)
        .await;
    assert_eq!(cached, Some(json!({"model": "gemini-pro"})));
}

// ============================================================================
// Schedules and fetchers
// ============================================================================

#[tokio::test]
async fn add_schedule_requires_a_fetcher() {
    let services = services();
    let err = services
        .warming()
        .add_schedule(schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30))
        .unwrap_err();
    assert!(matches!(err, MuninnError::UnknownFetcher(ref key) if key == "aws_pricing"));
    assert!(services.warming().schedules().is_empty());
}

#[tokio::test]
async fn adding_the_same_schedule_replaces_it() {
    let services = services();
    let warming = services.warming();
    warming.register_fetcher("aws", ServiceType::Storage, static_fetcher(json!(1)));

    warming
        .add_schedule(schedule("aws", ServiceType::Storage, "us-east-1", WarmingPriority::High, 60))
        .unwrap();
    warming
        .add_schedule(schedule("aws", ServiceType::Storage, "us-east-1", WarmingPriority::Low, 120))
        .unwrap();

    let schedules = warming.schedules();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].priority, WarmingPriority::Low);

    assert!(warming.remove_schedule(&schedules[0].id()));
    assert!(!warming.remove_schedule(&schedules[0].id()));
}

#[tokio::test]
async fn warm_one_unknown_schedule_is_an_error() {
    let services = services();
    let err = services.warming().warm_one("cloud_api:aws:compute:nowhere").await;
    assert!(matches!(err, Err(MuninnError::ScheduleNotFound(_))));
}

#[tokio::test]
async fn warm_one_without_fetcher_has_no_side_effects() {
    let services = services();
    let warming = services.warming();
    let s = schedule("azure", ServiceType::Database, "eastus", WarmingPriority::High, 60);
    let id = s.id();
    warming.extend_schedules([s]);

    assert!(!warming.warm_one(&id).await.unwrap());

    let after = warming.schedule(&id).unwrap();
    assert_eq!(after.warming_count, 0);
    assert_eq!(after.error_count, 0);
    assert!(after.last_warmed.is_none());
    assert!(after.last_outcome.is_none());
}

#[tokio::test]
async fn should_warm_flips_only_after_success() {
    let services = services();
    let warming = services.warming();
    warming.register_fetcher("aws", ServiceType::Pricing, static_fetcher(json!(1)));
    let s = schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30);
    let id = s.id();
    warming.add_schedule(s).unwrap();

    for _ in 0..3 {
        assert!(warming.schedule(&id).unwrap().should_warm());
    }

    assert!(warming.warm_one(&id).await.unwrap());
    assert!(!warming.schedule(&id).unwrap().should_warm());

    // Not due: a second cycle does nothing.
    let report = warming.run_warming_cycle().await;
    assert_eq!(report.processed, 0);
    assert_eq!(warming.schedule(&id).unwrap().warming_count, 1);
}

#[tokio::test]
async fn repeated_warming_keeps_tag_index_bounded() {
    let services = services();
    let warming = services.warming();
    warming.register_fetcher("aws", ServiceType::Compute, static_fetcher(json!({"n": 1})));
    let s = schedule("aws", ServiceType::Compute, "us-east-1", WarmingPriority::Critical, 30);
    let id = s.id();
    warming.add_schedule(s).unwrap();

    for _ in 0..20 {
        assert!(warming.warm_one(&id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // provider, service_type, region, priority and the latest warmed stamp.
    let stats = services.store().stats().await;
    assert_eq!(stats.total_keys, 1);
    assert_eq!(stats.tag_sets, 5);

    let entry = services.store().get(&id).await.unwrap();
    assert_eq!(entry.tags.iter().filter(|t| t.starts_with("warmed:")).count(), 1);
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn failures_are_recorded_and_the_cycle_continues() {
    let services = services();
    let warming = services.warming();
    warming.register_fetcher("azure", ServiceType::Pricing, failing_fetcher("503 from retail API"));
    warming.register_fetcher("aws", ServiceType::Pricing, static_fetcher(json!({"ok": true})));

    let bad = schedule("azure", ServiceType::Pricing, "eastus", WarmingPriority::Critical, 30);
    let good = schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30);
    let (bad_id, good_id) = (bad.id(), good.id());
    warming.add_schedule(bad).unwrap();
    warming.add_schedule(good).unwrap();

    let report = warming.run_warming_cycle().await;
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);

    let bad = warming.schedule(&bad_id).unwrap();
    assert_eq!(bad.error_count, 1);
    assert_eq!(bad.warming_count, 0);
    assert_eq!(bad.last_outcome, Some(WarmingOutcome::Failed));
    assert!(bad.last_error.unwrap().contains("503 from retail API"));
    // Still due: a failed attempt does not count as warmed.
    assert!(bad.last_warmed.is_none());

    assert_eq!(warming.schedule(&good_id).unwrap().warming_count, 1);
    assert!(!warming.warm_one(&bad_id).await.unwrap());
    assert_eq!(warming.schedule(&bad_id).unwrap().error_count, 2);
}

#[tokio::test]
async fn panicking_fetcher_is_recorded_as_failure() {
    let services = services();
    let warming = services.warming();
    warming.register_fetcher("gcp", ServiceType::Pricing, Arc::new(PanickingFetcher));
    warming.register_fetcher("aws", ServiceType::Pricing, static_fetcher(json!(1)));

    let bad = schedule("gcp", ServiceType::Pricing, "us-central1", WarmingPriority::Critical, 30);
    let bad_id = bad.id();
    warming.add_schedule(bad).unwrap();
    warming
        .add_schedule(schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30))
        .unwrap();

    let report = warming.run_warming_cycle().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);

    let bad = warming.schedule(&bad_id).unwrap();
    assert_eq!(bad.error_count, 1);
    assert!(bad.last_error.unwrap().contains("panicked"));
}

#[tokio::test]
async fn schedules_without_fetchers_are_skipped() {
    let services = services();
    let warming = services.warming();
    warming.register_fetcher("aws", ServiceType::Compute, static_fetcher(json!(1)));
    warming.extend_schedules([
        schedule("aws", ServiceType::Compute, "us-east-1", WarmingPriority::Critical, 30),
        schedule("oracle", ServiceType::Compute, "us-ashburn-1", WarmingPriority::Critical, 30),
    ]);

    let report = warming.run_warming_cycle().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.tier(WarmingPriority::Critical).unwrap().skipped, 1);
}

// ============================================================================
// Ordering and batching
// ============================================================================

#[tokio::test]
async fn tiers_run_in_priority_order() {
    let services = services();
    let warming = services.warming();
    let log = Arc::new(Mutex::new(Vec::new()));

    warming.register_fetcher("terraform", ServiceType::TerraformModules, recording_fetcher(log.clone(), "low"));
    warming.register_fetcher("aws", ServiceType::AiMl, recording_fetcher(log.clone(), "medium"));
    warming.register_fetcher("aws", ServiceType::Storage, recording_fetcher(log.clone(), "high"));
    warming.register_fetcher("aws", ServiceType::Pricing, recording_fetcher(log.clone(), "critical"));

    // Listed lowest priority first.
    for s in [
        schedule("terraform", ServiceType::TerraformModules, "global", WarmingPriority::Low, 1440),
        schedule("aws", ServiceType::AiMl, "us-east-1", WarmingPriority::Medium, 240),
        schedule("aws", ServiceType::Storage, "us-east-1", WarmingPriority::High, 60),
        schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30),
    ] {
        warming.add_schedule(s).unwrap();
    }

    let report = warming.run_warming_cycle().await;
    assert_eq!(report.succeeded, 4);

    let order: Vec<WarmingPriority> = report.by_priority.iter().map(|t| t.priority).collect();
    assert_eq!(
        order,
        vec![
            WarmingPriority::Critical,
            WarmingPriority::High,
            WarmingPriority::Medium,
            WarmingPriority::Low
        ]
    );
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "critical:us-east-1",
            "high:us-east-1",
            "medium:us-east-1",
            "low:global"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn batches_and_tiers_are_paused() {
    let services = services_with(WarmingConfig::default(), ManagerConfig::default());
    let warming = services.warming();
    warming.register_fetcher("aws", ServiceType::Pricing, static_fetcher(json!(1)));
    warming.register_fetcher("aws", ServiceType::Storage, static_fetcher(json!(2)));

    // Seven critical schedules: batches of 5 + 2, one 2 s pause.
    for region in ["r1", "r2", "r3", "r4", "r5", "r6", "r7"] {
        warming
            .add_schedule(schedule("aws", ServiceType::Pricing, region, WarmingPriority::Critical, 30))
            .unwrap();
    }
    // Four high schedules: batches of 3 + 1, one 5 s pause, after a 10 s tier pause.
    for region in ["r1", "r2", "r3", "r4"] {
        warming
            .add_schedule(schedule("aws", ServiceType::Storage, region, WarmingPriority::High, 60))
            .unwrap();
    }

    let started = tokio::time::Instant::now();
    let report = warming.run_warming_cycle().await;
    let elapsed = started.elapsed();

    assert_eq!(report.succeeded, 11);
    assert_eq!(report.tier(WarmingPriority::Critical).unwrap().processed, 7);
    assert_eq!(report.tier(WarmingPriority::High).unwrap().processed, 4);
    // 2 s + 10 s + 5 s; no pause after the last tier.
    assert!(elapsed >= Duration::from_secs(17), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(27), "elapsed {elapsed:?}");
}

// ============================================================================
// Refresh-ahead
// ============================================================================

#[tokio::test]
async fn refresh_ahead_reads_trigger_early_warming() {
    let services = services_with(
        WarmingConfig::new().pauses(Duration::ZERO, Duration::ZERO, Duration::ZERO),
        ManagerConfig::new().refresh_ahead_fraction(0.0),
    );
    let warming = services.warming();
    warming.register_fetcher("aws", ServiceType::Pricing, static_fetcher(json!(1)));
    let s = schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30);
    let id = s.id();
    warming.add_schedule(s).unwrap();

    warming.run_warming_cycle().await;
    assert!(!warming.schedule(&id).unwrap().should_warm());

    let data = services
        .manager()
        .lookup("aws", ServiceType::Pricing, "us-east-1", None, false)
        .await
        .unwrap();
    assert!(data.needs_refresh);

    let report = warming.run_warming_cycle().await;
    assert_eq!(report.refresh_requests, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(warming.schedule(&id).unwrap().warming_count, 2);
    assert_eq!(services.manager().pending_refreshes(), 0);
}

// ============================================================================
// Concurrency and lifecycle
// ============================================================================

#[tokio::test]
async fn overlapping_cycles_are_refused() {
    let services = services();
    let warming = Arc::clone(services.warming());
    let release = Arc::new(Notify::new());
    warming.register_fetcher("aws", ServiceType::Compute, gated_fetcher(release.clone()));
    warming
        .add_schedule(schedule("aws", ServiceType::Compute, "us-east-1", WarmingPriority::Critical, 30))
        .unwrap();

    let first = tokio::spawn({
        let warming = Arc::clone(&warming);
        async move { warming.run_warming_cycle().await }
    });
    wait_until(|| warming.is_cycle_running()).await;

    let second = warming.run_warming_cycle().await;
    assert!(second.overlapped);
    assert_eq!(second.processed, 0);

    release.notify_one();
    let first = first.await.unwrap();
    assert!(!first.overlapped);
    assert_eq!(first.succeeded, 1);
    assert!(!warming.is_cycle_running());
}

#[tokio::test]
async fn start_runs_a_cycle_and_stop_ends_the_loop() {
    let services = services();
    let warming = Arc::clone(services.warming());
    warming.register_fetcher("aws", ServiceType::Pricing, static_fetcher(json!(1)));
    warming
        .add_schedule(schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30))
        .unwrap();

    assert!(warming.start(Duration::from_secs(3600)));
    assert!(!warming.start(Duration::from_secs(3600)));
    assert!(warming.is_running());

    wait_until(|| warming.status().cycles_completed >= 1).await;

    assert!(warming.stop().await);
    assert!(!warming.is_running());
    assert!(!warming.stop().await);

    let status = warming.status();
    assert!(!status.running);
    assert_eq!(status.total_warmings, 1);
    assert_eq!(status.last_cycle.unwrap().succeeded, 1);
}

#[tokio::test]
async fn start_default_uses_the_configured_interval() {
    let services = services_with(
        WarmingConfig::new()
            .pauses(Duration::ZERO, Duration::ZERO, Duration::ZERO)
            .cycle_interval(Duration::from_secs(3600)),
        ManagerConfig::default(),
    );
    let warming = Arc::clone(services.warming());
    warming.register_fetcher("gcp", ServiceType::Storage, static_fetcher(json!(1)));
    warming
        .add_schedule(schedule("gcp", ServiceType::Storage, "us-central1", WarmingPriority::High, 60))
        .unwrap();

    assert!(warming.start_default());
    assert!(!warming.start_default());

    wait_until(|| warming.status().cycles_completed >= 1).await;
    assert_eq!(warming.status().cycles_completed, 1);

    assert!(warming.stop().await);
    assert_eq!(warming.status().total_warmings, 1);
}

#[tokio::test]
async fn stop_waits_for_the_in_flight_cycle() {
    let services = services();
    let warming = Arc::clone(services.warming());
    let release = Arc::new(Notify::new());
    warming.register_fetcher("aws", ServiceType::Compute, gated_fetcher(release.clone()));
    let s = schedule("aws", ServiceType::Compute, "eu-west-1", WarmingPriority::Critical, 30);
    let id = s.id();
    warming.add_schedule(s).unwrap();

    warming.start(Duration::from_secs(3600));
    wait_until(|| warming.is_cycle_running()).await;

    let stopper = tokio::spawn({
        let warming = Arc::clone(&warming);
        async move { warming.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopper.is_finished());

    release.notify_one();
    assert!(stopper.await.unwrap());

    // The cycle completed rather than being aborted.
    assert_eq!(warming.schedule(&id).unwrap().warming_count, 1);
    assert!(!warming.is_cycle_running());
}

// ============================================================================
// Optimization
// ============================================================================

#[tokio::test]
async fn high_hit_rate_doubles_frequency_with_cap() {
    let services = services();
    let warming = services.warming();
    let manager = services.manager();

    warming.extend_schedules([
        schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30),
        schedule("aws", ServiceType::Pricing, "eu-west-1", WarmingPriority::Critical, 200),
        schedule("aws", ServiceType::Pricing, "us-west-2", WarmingPriority::Critical, 240),
    ]);

    manager
        .set_cached_data("aws", ServiceType::Pricing, "us-east-1", &json!(1), None, &[] as &[&str])
        .await;
    for _ in 0..20 {
        manager
            .get_cached_data("aws", ServiceType::Pricing, "us-east-1", None, false)
            .await;
    }
    let metrics = manager.metrics_for("aws", ServiceType::Pricing).unwrap();
    assert!(metrics.optimization_score >= 90.0);

    let outcome = warming.optimize_schedules();
    assert_eq!(outcome.optimizations_made, 2);

    let frequencies: Vec<u32> = warming
        .schedules()
        .iter()
        .map(|s| s.frequency_minutes)
        .collect();
    assert_eq!(frequencies, vec![60, 240, 240]);

    let change = &outcome.recommendations[0];
    assert_eq!(change.old_frequency_minutes, 30);
    assert_eq!(change.new_frequency_minutes, 60);
    assert!(change.reason.contains("high"));
}

#[tokio::test]
async fn low_hit_rate_halves_frequency_with_floor() {
    let services = services();
    let warming = services.warming();
    let manager = services.manager();

    warming.extend_schedules([
        schedule("gcp", ServiceType::Compute, "us-central1", WarmingPriority::High, 60),
        schedule("gcp", ServiceType::Compute, "europe-west1", WarmingPriority::High, 20),
        schedule("gcp", ServiceType::Compute, "asia-east1", WarmingPriority::High, 10),
        schedule("gcp", ServiceType::Storage, "us-central1", WarmingPriority::High, 60),
    ]);

    for _ in 0..5 {
        manager
            .get_cached_data("gcp", ServiceType::Compute, "us-central1", None, false)
            .await;
    }

    let outcome = warming.optimize_schedules();
    assert_eq!(outcome.optimizations_made, 2);

    let frequencies: Vec<u32> = warming
        .schedules()
        .iter()
        .map(|s| s.frequency_minutes)
        .collect();
    // Untracked pairs (gcp storage) are left alone; 10 is never raised to 15.
    assert_eq!(frequencies, vec![30, 15, 10, 60]);
}

// ============================================================================
// Status
// ============================================================================

#[tokio::test]
async fn status_counts_by_priority() {
    let services = services();
    let warming = services.warming();
    warming.register_fetcher("aws", ServiceType::Pricing, static_fetcher(json!(1)));
    warming.extend_schedules([
        schedule("aws", ServiceType::Pricing, "us-east-1", WarmingPriority::Critical, 30),
        schedule("aws", ServiceType::Pricing, "eu-west-1", WarmingPriority::Critical, 30),
        schedule("terraform", ServiceType::TerraformProviders, "global", WarmingPriority::Low, 1440),
    ]);

    warming.run_warming_cycle().await;
    let status = warming.status();

    assert_eq!(status.total_schedules, 3);
    assert_eq!(status.total_warmings, 2);
    assert_eq!(status.cycles_completed, 1);
    assert_eq!(status.registered_fetchers, vec!["aws_pricing".to_string()]);

    let critical = &status.by_priority[0];
    assert_eq!(critical.priority, WarmingPriority::Critical);
    assert_eq!(critical.schedules, 2);
    assert_eq!(critical.due, 0);

    let low = &status.by_priority[3];
    assert_eq!(low.schedules, 1);
    assert_eq!(low.due, 1);
    assert_eq!(status.due_now, 1);
}
