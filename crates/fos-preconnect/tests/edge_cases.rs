//! Edge case tests for fos-preconnect
//!
//! History bounds, weight smoothing and persistence.

use std::sync::Arc;

use fos_preconnect::*;

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ============================================================================
// SUBHOST TESTS
// ============================================================================

#[test]
fn test_weight_smoothing_over_loads() {
    let mut sub = Subhost::new("cdn.com");
    assert!(approx(sub.weight(), 1.0));

    sub.increment_weight(0.33);
    sub.decrement_weight(0.67);
    assert!(approx(sub.weight(), 1.33 * 0.67));
}

#[test]
fn test_reference_smoothing() {
    let mut sub = Subhost::new("cdn.com");
    for _ in 0..5 {
        sub.increment_references();
    }
    sub.update_references();
    assert_eq!(sub.number_of_references(), 6);
    assert_eq!(sub.old_number_of_references(), Some(6));

    sub.reset_references();
    sub.increment_references();
    sub.update_references();
    // (1 + 6) / 2
    assert_eq!(sub.number_of_references(), 3);
}

#[test]
fn test_with_stats_clamps_weight() {
    assert_eq!(Subhost::with_stats("a", 1, -3.0).weight(), 0.0);
    assert_eq!(Subhost::with_stats("a", 1, f64::NAN).weight(), 0.0);
}

// ============================================================================
// URL HISTORY TESTS
// ============================================================================

#[test]
fn test_subhost_count_never_exceeds_cap() {
    let mut history = UrlHistory::with_limits(
        "a.com",
        UrlHistoryLimits {
            max_subhosts: 5,
            subhost_evict_batch: 2,
            ..Default::default()
        },
    );

    for i in 0..50 {
        history.add_subhost(&format!("host{}.com", i));
        assert!(history.len() <= 5);
    }
}

#[test]
fn test_ranked_candidates_sorted_and_capped() {
    let mut history = UrlHistory::new("a.com");
    for i in 0..40u32 {
        let host = format!("h{:02}.com", i % 20);
        history.add_subhost(&host);
    }
    history.update_subhosts_to_connect();

    let ranked = history.subhosts_to_connect().unwrap();
    assert_eq!(ranked.len(), UrlHistoryLimits::default().max_to_connect);
    assert!(ranked.windows(2).all(|w| w[0].weight() >= w[1].weight()));
}

// ============================================================================
// SUBRESOURCE HISTORY TESTS
// ============================================================================

#[test]
fn test_second_load_of_page() {
    let history = SubResourcesHistory::default();
    let hosts = ["x1.com", "x2.com", "x3.com", "x4.com", "x5.com"];

    history.update_url_history("a.com");
    for host in hosts {
        history.add_sub_host("a.com", host);
        history.add_sub_host("a.com", host);
    }
    history.on_load_finished("a.com");

    let first = history.get_subhosts_to_connect("a.com").unwrap();
    assert_eq!(first.len(), 5);
    assert!(first.iter().all(|s| approx(s.weight(), 1.33)));
    assert!(first.iter().all(|s| s.number_of_references() == 2));

    history.update_url_history("a.com");
    for host in hosts {
        history.add_sub_host("a.com", host);
        history.add_sub_host("a.com", host);
    }
    history.on_load_finished("a.com");

    let second = history.get_subhosts_to_connect("a.com").unwrap();
    assert!(second.iter().all(|s| approx(s.weight(), 1.33 * 0.67 + 0.66)));
    assert!(second.iter().all(|s| s.number_of_references() == 2));
    assert_eq!(history.use_count("a.com"), 2);
}

#[test]
fn test_main_host_eviction_keeps_most_used() {
    let history = SubResourcesHistory::new(HistoryConfig {
        max_main_hosts: 2,
        main_host_evict_batch: 1,
        ..Default::default()
    });

    history.add_sub_host("a", "cdn");
    history.set_use_count("a", 5);
    history.add_sub_host("b", "cdn");
    history.set_use_count("b", 1);
    history.add_sub_host("c", "cdn");

    let mut hosts = history.main_hosts();
    hosts.sort();
    assert_eq!(hosts, vec!["a", "c"]);
}

#[test]
fn test_main_host_count_never_exceeds_cap() {
    let history = SubResourcesHistory::new(HistoryConfig {
        max_main_hosts: 10,
        main_host_evict_batch: 3,
        ..Default::default()
    });

    for i in 0..100 {
        history.add_sub_host(&format!("page{}.com", i), "cdn.com");
        assert!(history.len() <= 10);
    }
}

#[test]
fn test_concurrent_recording() {
    let history = Arc::new(SubResourcesHistory::new(HistoryConfig {
        max_main_hosts: 8,
        main_host_evict_batch: 2,
        ..Default::default()
    }));

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let history = Arc::clone(&history);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let main = format!("page{}.com", (i + t) % 16);
                    history.add_sub_host(&main, &format!("cdn{}.com", i % 40));
                    if i % 10 == 0 {
                        history.on_load_finished(&main);
                        let _ = history.get_subhosts_to_connect(&main);
                    }
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    assert!(history.len() <= 8);
    for main in history.main_hosts() {
        assert!(history.get_subhosts(&main).unwrap().len() <= 30);
    }
}

// ============================================================================
// PERSISTENCE TESTS
// ============================================================================

#[test]
fn test_history_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn HistoryStore> = Arc::new(JsonFileStore::new(dir.path().join("preconnect.json")));

    let registry = HistoryRegistry::new(Arc::clone(&store), HistoryConfig::default());
    let handle = registry.acquire();
    handle.add_sub_host("a.com", "cdn.com");
    handle.add_sub_host("a.com", "cdn.com");
    handle.on_load_finished("a.com");
    handle.release();

    let registry = HistoryRegistry::new(store, HistoryConfig::default());
    let handle = registry.acquire();
    let candidates = handle.get_subhosts_to_connect("a.com").unwrap();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].host(), "cdn.com");
    assert!(approx(candidates[0].weight(), 1.33));
    assert_eq!(candidates[0].number_of_references(), 2);
    assert_eq!(handle.use_count("a.com"), 1);
    assert!(!handle.is_dirty());
    Ok(())
}

#[test]
fn test_corrupt_store_starts_empty() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("preconnect.json");
    std::fs::write(&path, "[{\"broken\":")?;

    let registry = HistoryRegistry::new(Arc::new(JsonFileStore::new(path)), HistoryConfig::default());
    let handle = registry.acquire();
    assert!(handle.is_empty());
    Ok(())
}

// ============================================================================
// HOST KEY TESTS
// ============================================================================

#[test]
fn test_host_key_normalization() {
    assert_eq!(host_key("HTTPS://WWW.Example.COM/path").unwrap(), "www.example.com");
    assert_eq!(host_key("http://[::1]:8080/").unwrap(), "[::1]:8080");
    assert!(matches!(host_key("   "), Err(PreconnectError::InvalidHost(_))));
}
