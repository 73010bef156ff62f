use std::{sync::Arc, time::Duration};

use timed_kv::TimedMap;

#[tokio::test]
async fn test_elapsed_time_tracks_real_clock() {
    let map = TimedMap::new();
    map.put("a", 1);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let elapsed = map.elapsed_millis("a");
    assert!(elapsed >= 100, "elapsed was {}ms", elapsed);
    assert!(elapsed < 1_000, "elapsed was {}ms", elapsed);
}

#[tokio::test]
async fn test_elapsed_time_is_monotonic_between_writes() {
    let map = TimedMap::new();
    map.put("a", 1);

    let mut previous = map.elapsed_time("a");
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let current = map.elapsed_time("a");
        assert!(current >= previous);
        previous = current;
    }

    map.put("a", 2);
    assert!(map.elapsed_time("a") < previous);
}

#[tokio::test]
async fn test_failed_remove_keeps_timestamp() {
    let map = TimedMap::new();
    map.put("a", "right");
    let written_at = map.timestamp("a");

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!map.remove_if("a", &"wrong"));
    assert_eq!(map.get("a"), Some("right"));
    assert_eq!(map.timestamp("a"), written_at);
    assert!(map.elapsed_millis("a") >= 20);
}

#[tokio::test]
async fn test_put_if_absent_keeps_first_timestamp() {
    let map = TimedMap::new();
    assert_eq!(map.put_if_absent("k", "v1"), None);

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(map.put_if_absent("k", "v2"), Some("v1"));
    assert_eq!(map.get("k"), Some("v1"));
    assert!(map.elapsed_millis("k") >= 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_put_if_absent() {
    let map = Arc::new(TimedMap::<String, usize>::new());

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let map = map.clone();
            tokio::spawn(async move { (i, map.put_if_absent("contended".into(), i)) })
        })
        .collect();

    let mut winners = vec![];
    let mut reported = vec![];
    for handle in handles {
        let (i, previous) = handle.await.unwrap();
        match previous {
            None => winners.push(i),
            Some(seen) => reported.push(seen),
        }
    }

    assert_eq!(winners.len(), 1);
    let stored = map.get("contended").unwrap();
    assert_eq!(stored, winners[0]);
    assert!(reported.iter().all(|seen| *seen == stored));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_distinct_keys() {
    let map = Arc::new(TimedMap::<String, usize>::with_capacity_and_shard_amount(0, 16));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let map = map.clone();
            tokio::spawn(async move {
                for round in 0..100 {
                    let key = format!("worker-{}", worker);
                    map.put(key.clone(), round);
                    assert!(map.replace_if(&key, &round, round + 1));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(map.len(), 8);
    assert!(map.values().iter().all(|value| *value == 100));
}
