// SPDX-License-Identifier: MIT

//! End-to-end import pipeline: first-contact index builds, cache-hit
//! serving, bounded upstream imports, and failure handling.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracklog::config::Config;
use tracklog::import::{ImportQuery, ImportRecord};
use tracklog::models::StreamData;
use tracklog::upstream::RawStream;

use common::{entry, raw_streams, summary, test_engine, test_engine_with, MockUpstream};

const USER: u64 = 10;

fn streams_query() -> ImportQuery {
    ImportQuery {
        streams: true,
        ..Default::default()
    }
}

/// A mock with `n` activities (newest-first) that all have streams.
fn mock_with_activities(n: u64) -> MockUpstream {
    let mut mock = MockUpstream::default();
    for i in 0..n {
        let id = n - i; // newest first
        mock.summaries.push(summary(id, id as u32));
        mock.streams.insert(id, raw_streams());
    }
    mock
}

async fn collect(
    engine: &tracklog::Engine,
    client: Arc<MockUpstream>,
    query: ImportQuery,
) -> Vec<ImportRecord> {
    engine
        .importer
        .query_activities(USER, client, query)
        .collect()
        .await
}

fn done_counts(records: &[ImportRecord]) -> (usize, usize, usize, usize) {
    match records.last() {
        Some(ImportRecord::Done {
            count,
            fetched,
            imported,
            empty,
        }) => (*count, *fetched, *imported, *empty),
        other => panic!("expected terminal Done record, got {other:?}"),
    }
}

#[tokio::test]
async fn test_first_contact_builds_full_index_and_imports() {
    let mut config = Config::test_default();
    config.fetch_page_size = 3;
    let engine = test_engine_with(config);
    let mock = Arc::new(mock_with_activities(7));

    let records = collect(
        &engine,
        mock.clone(),
        ImportQuery { limit: 5, ..streams_query() },
    )
    .await;

    // The whole history is indexed even though only 5 were rendered.
    assert_eq!(engine.index.size_for_user(USER).await.unwrap(), 7);
    // 3 full pages plus the terminating empty page.
    assert_eq!(mock.summary_calls.load(Ordering::SeqCst), 4);

    let activities: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            ImportRecord::Activity { entry, streams } => Some((entry.id, streams.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(activities.len(), 5);
    for (_, streams) in &activities {
        assert!(matches!(streams.get("time"), Some(StreamData::Encoded(_))));
        assert!(matches!(streams.get("polyline"), Some(StreamData::Polyline(_))));
    }

    assert!(records
        .iter()
        .any(|r| matches!(r, ImportRecord::Progress { .. })));
    assert!(records.contains(&ImportRecord::StopRendering));

    let (count, fetched, imported, empty) = done_counts(&records);
    assert_eq!((count, fetched, imported, empty), (5, 0, 5, 0));
}

#[tokio::test]
async fn test_indexed_user_served_from_cache() {
    let engine = test_engine();
    let mock = Arc::new(mock_with_activities(3));

    // Build once (populates index and cache), then query again.
    collect(&engine, mock.clone(), streams_query()).await;
    let calls_after_build = mock.stream_calls.load(Ordering::SeqCst);

    let records = collect(&engine, mock.clone(), streams_query()).await;
    let (count, fetched, imported, _) = done_counts(&records);
    assert_eq!((count, fetched, imported), (3, 3, 0));
    // No new upstream stream fetches.
    assert_eq!(mock.stream_calls.load(Ordering::SeqCst), calls_after_build);
}

#[tokio::test]
async fn test_streamless_activity_becomes_empty_marker() {
    let engine = test_engine();
    let mut mock = mock_with_activities(2);
    // Activity 1 has no streams at all.
    mock.streams.remove(&1);
    let mock = Arc::new(mock);

    let records = collect(&engine, mock.clone(), streams_query()).await;
    let (count, _, imported, empty) = done_counts(&records);
    assert_eq!((count, imported, empty), (1, 1, 1));

    // The confirmed-empty result was cached; a re-query does not retry
    // the upstream fetch.
    let calls = mock.stream_calls.load(Ordering::SeqCst);
    let records = collect(&engine, mock.clone(), streams_query()).await;
    let (_, _, _, empty) = done_counts(&records);
    assert_eq!(empty, 1);
    assert_eq!(mock.stream_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_concurrent_first_contact_fails_fast() {
    let engine = test_engine();
    let mut mock = mock_with_activities(4);
    mock.page_delay = Duration::from_millis(100);
    let mock = Arc::new(mock);

    let first = engine
        .importer
        .query_activities(USER, mock.clone(), streams_query());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = engine
        .importer
        .query_activities(USER, mock.clone(), streams_query());

    // The latecomer is rejected while the build holds the marker.
    let second_records: Vec<_> = second.collect().await;
    assert!(matches!(second_records[..], [ImportRecord::Error(_)]));

    let first_records: Vec<_> = first.collect().await;
    done_counts(&first_records);
}

#[tokio::test]
async fn test_indexing_marker_cleared_after_build() {
    let engine = test_engine();
    // No activities upstream: the build completes with an empty index.
    let mock = Arc::new(MockUpstream::default());

    let records = collect(&engine, mock.clone(), streams_query()).await;
    done_counts(&records);

    // A second attempt must start a fresh build, not hit the marker.
    let records = collect(&engine, mock, streams_query()).await;
    assert!(!records
        .iter()
        .any(|r| matches!(r, ImportRecord::Error(_))));
}

#[tokio::test]
async fn test_missing_index_without_build_permission_is_an_error() {
    let engine = test_engine();
    let mock = Arc::new(mock_with_activities(3));

    let records = collect(
        &engine,
        mock.clone(),
        ImportQuery { build: false, ..streams_query() },
    )
    .await;

    assert!(matches!(records[..], [ImportRecord::Error(_)]));
    assert_eq!(engine.index.size_for_user(USER).await.unwrap(), 0);
    assert_eq!(mock.summary_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_per_activity_failure_is_skipped() {
    let engine = test_engine();
    let mut mock = mock_with_activities(3);
    mock.fail_streams.insert(2);
    let mock = Arc::new(mock);

    let records = collect(&engine, mock, streams_query()).await;
    let (count, _, imported, _) = done_counts(&records);
    assert_eq!((count, imported), (2, 2));
    assert!(!records
        .iter()
        .any(|r| matches!(r, ImportRecord::Error(_))));
}

#[tokio::test]
async fn test_dropped_consumer_stops_upstream_fetches() {
    let mut config = Config::test_default();
    config.concurrency = 1;
    let engine = test_engine_with(config);
    // Pre-indexed user, so all remaining work is stream fetches.
    for id in 1..=6 {
        engine.index.add(entry(id, USER, id as u32)).await.unwrap();
    }
    let mut mock = mock_with_activities(6);
    mock.stream_delay = Duration::from_millis(50);
    let mock = Arc::new(mock);

    let mut stream = engine
        .importer
        .query_activities(USER, mock.clone(), streams_query());
    // Take one record, then walk away.
    assert!(stream.next().await.is_some());
    drop(stream);

    // The fetch already in flight may finish; the next send fails and
    // the producer stops instead of importing the rest.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = mock.stream_calls.load(Ordering::SeqCst);
    assert!(settled < 6, "fetches continued after drop: {settled}");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mock.stream_calls.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn test_blank_series_become_empty_marker() {
    let engine = test_engine();
    let mut mock = mock_with_activities(1);
    // Streams are present but carry no samples.
    mock.streams.insert(
        1,
        HashMap::from([
            ("latlng".to_string(), RawStream::LatLng(Vec::new())),
            ("time".to_string(), RawStream::Ints(Vec::new())),
        ]),
    );
    let mock = Arc::new(mock);

    let records = collect(&engine, mock, streams_query()).await;
    let (count, _, _, empty) = done_counts(&records);
    assert_eq!((count, empty), (0, 1));
}

#[tokio::test]
async fn test_invalid_credential_is_fatal() {
    let engine = test_engine();
    // The index exists so the failure comes from the stream phase.
    for id in [1, 2] {
        engine.index.add(entry(id, USER, id as u32)).await.unwrap();
    }
    let mock = Arc::new(MockUpstream {
        credential_invalid: true,
        ..MockUpstream::default()
    });

    let records = collect(&engine, mock, streams_query()).await;
    assert!(matches!(
        records.last(),
        Some(ImportRecord::Error(msg)) if msg.contains("credential")
    ));
    assert!(!records
        .iter()
        .any(|r| matches!(r, ImportRecord::Done { .. })));
}

#[tokio::test]
async fn test_reconciliation_sends_delete_record() {
    let engine = test_engine();
    for id in [1, 2] {
        engine.index.add(entry(id, USER, id as u32)).await.unwrap();
    }
    let mock = Arc::new(MockUpstream::default());

    let records = collect(
        &engine,
        mock,
        ImportQuery {
            exclude_ids: HashSet::from([2, 99]),
            streams: false,
            ..Default::default()
        },
    )
    .await;

    assert!(records.contains(&ImportRecord::Delete(vec![99])));
    let activities: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            ImportRecord::Activity { entry, .. } => Some(entry.id),
            _ => None,
        })
        .collect();
    assert_eq!(activities, vec![1]);
}

#[tokio::test]
async fn test_import_by_id_indexes_and_caches() {
    let engine = test_engine();
    let mock = Arc::new(mock_with_activities(3));
    // import_by_id bypasses the index query entirely.
    let imported = engine
        .importer
        .import_by_id(USER, mock, &[2])
        .await
        .unwrap();

    assert_eq!(imported, 1);
    assert!(engine.index.get(2).await.unwrap().is_some());
    let cached = engine
        .cache
        .get(2, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert!(!cached.empty);
}

#[tokio::test]
async fn test_query_logs_summary_event() {
    let engine = test_engine();
    let mock = Arc::new(mock_with_activities(2));

    collect(&engine, mock, streams_query()).await;

    let events = engine.events.read(0).await.unwrap();
    assert!(events.iter().any(|e| e.msg.contains("queued 2 activities")));
}

#[tokio::test]
async fn test_summaries_without_position_are_not_indexed() {
    let engine = test_engine();
    let mut mock = mock_with_activities(2);
    let mut indoor = summary(3, 3);
    indoor.start_latlng = None;
    mock.summaries.insert(0, indoor);
    let mock = Arc::new(mock);

    collect(&engine, mock, streams_query()).await;
    assert_eq!(engine.index.size_for_user(USER).await.unwrap(), 2);
    assert!(engine.index.get(3).await.unwrap().is_none());
}

#[tokio::test]
async fn test_render_view_is_limited_to_output_streams() {
    let mut config = Config::test_default();
    config.streams_to_cache = vec!["polyline".into(), "time".into(), "altitude".into()];
    config.streams_out = vec!["polyline".into()];
    let engine = test_engine_with(config);

    let mut mock = mock_with_activities(1);
    let mut streams = raw_streams();
    streams.insert(
        "altitude".to_string(),
        tracklog::upstream::RawStream::Floats(vec![12.0, 12.5, 13.0]),
    );
    mock.streams.insert(1, streams);
    let mock = Arc::new(mock);

    let records = collect(&engine, mock, streams_query()).await;
    let payload = records
        .iter()
        .find_map(|r| match r {
            ImportRecord::Activity { streams, .. } => Some(streams.clone()),
            _ => None,
        })
        .unwrap();

    assert!(payload.get("polyline").is_some());
    assert!(payload.get("time").is_none());
    assert!(payload.get("altitude").is_none());

    // The full stream set is still cached.
    let cached = engine
        .cache
        .get(1, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.streams.len(), 3);
    assert!(matches!(
        cached.get("altitude"),
        Some(StreamData::Raw(_))
    ));
}

#[tokio::test]
async fn test_summaries_only_query_skips_stream_phase() {
    let engine = test_engine();
    engine.index.add(entry(1, USER, 1)).await.unwrap();
    let mock = Arc::new(MockUpstream::default());

    let records = collect(
        &engine,
        mock.clone(),
        ImportQuery { streams: false, ..Default::default() },
    )
    .await;
    assert_eq!(mock.stream_calls.load(Ordering::SeqCst), 0);
    let (count, fetched, imported, empty) = done_counts(&records);
    assert_eq!((count, fetched, imported, empty), (1, 0, 0, 0));
}
