//! End-to-end pipeline tests
//!
//! Archives are served by a wiremock server and loaded into the in-memory
//! spatial store, so these run without Docker or network access.

mod common;

use common::{
    init_test_tracing, kml_document, kmz_bytes, line, point, polygon, source,
    three_shape_document,
};
use geoarc_common::GeometryKind;
use geoarc_ingest::config::FetchConfig;
use geoarc_ingest::fetcher::ArchiveFetcher;
use geoarc_ingest::loader::{kml_fragment, SpatialLoader};
use geoarc_ingest::orchestrator::IngestOrchestrator;
use geoarc_ingest::report::SourceStatus;
use geoarc_ingest::store::{ExtensionState, MemoryStore, StoreCall};
use geoarc_ingest::{PipelineError, Stage};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TABLE: &str = "kmz_features";

fn orchestrator(store: &MemoryStore) -> IngestOrchestrator<MemoryStore> {
    IngestOrchestrator::new(
        ArchiveFetcher::new(&FetchConfig::default()).unwrap(),
        SpatialLoader::new(store.clone(), TABLE),
    )
}

async fn serve_kmz(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_successful_source_and_unreachable_source() {
    init_test_tracing();
    let server = MockServer::start().await;
    serve_kmz(&server, "/s1.kmz", kmz_bytes(&[("doc.kml", &three_shape_document())])).await;
    Mock::given(method("GET"))
        .and(path("/s2.kmz"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = MemoryStore::with_table(TABLE);
    let sources = vec![
        source("s1", &format!("{}/s1.kmz", server.uri())),
        source("s2", &format!("{}/s2.kmz", server.uri())),
    ];

    let report = orchestrator(&store).run(&sources).await.unwrap();

    assert_eq!(report.sources.len(), 2);
    assert_eq!(report.sources[0].source_id, "s1");
    assert_eq!(report.sources[1].source_id, "s2");
    assert_eq!(report.succeeded_count(), 1);
    // One failed source does not fail the run
    assert!(report.is_success());

    match &report.sources[0].status {
        SourceStatus::Succeeded(outcome) => {
            assert_eq!(outcome.inserted, 3);
            assert_eq!(outcome.failed, 0);
            assert_eq!(outcome.total_rows, Some(3));
        },
        other => panic!("s1 should succeed, got {:?}", other),
    }
    match &report.sources[1].status {
        SourceStatus::Failed { stage, reason } => {
            assert_eq!(*stage, Stage::Fetch);
            assert!(reason.contains("404"));
        },
        other => panic!("s2 should fail, got {:?}", other),
    }

    let rows = store.rows(TABLE);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.source_id == "s1"));

    let kinds: Vec<_> = rows.iter().map(|r| r.geometry.kind).collect();
    assert_eq!(
        kinds,
        vec![GeometryKind::Point, GeometryKind::LineString, GeometryKind::Polygon]
    );
    assert_eq!(rows[1].metadata["original_geometry_kind"], "LINESTRING");
    assert_eq!(rows[0].name.as_deref(), Some("pole-1"));
}

#[tokio::test]
async fn test_unreachable_host_fails_only_its_source() {
    init_test_tracing();
    let server = MockServer::start().await;
    serve_kmz(
        &server,
        "/s1.kmz",
        kmz_bytes(&[("doc.kml", &kml_document(&point("A", "-1,2,0")))]),
    )
    .await;

    let store = MemoryStore::with_table(TABLE);
    let sources = vec![
        source("s1", &format!("{}/s1.kmz", server.uri())),
        source("s2", "http://127.0.0.1:9/unreachable.kmz"),
    ];

    let report = orchestrator(&store).run(&sources).await.unwrap();

    assert!(report.is_success());
    match &report.source("s1").unwrap().status {
        SourceStatus::Succeeded(outcome) => assert_eq!(outcome.inserted, 1),
        other => panic!("s1 should succeed, got {:?}", other),
    }
    match &report.source("s2").unwrap().status {
        SourceStatus::Failed { stage, reason } => {
            assert_eq!(*stage, Stage::Fetch);
            assert!(reason.contains("s2"));
        },
        other => panic!("s2 should fail, got {:?}", other),
    }

    let rows = store.rows(TABLE);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name.as_deref(), Some("A"));
    assert_eq!(rows[0].geometry.kind, GeometryKind::Point);
    assert_eq!(
        rows[0].kml_fragment,
        kml_fragment(GeometryKind::Point, "-1,2,0")
    );
    assert_eq!(rows[0].geometry.positions, vec![vec![-1.0, 2.0, 0.0]]);
}

#[tokio::test]
async fn test_run_fails_when_every_source_fails() {
    let store = MemoryStore::with_table(TABLE);
    let sources = vec![
        source("s1", "http://127.0.0.1:9/a.kmz"),
        source("s2", "http://127.0.0.1:9/b.kmz"),
    ];

    let report = orchestrator(&store).run(&sources).await.unwrap();

    assert_eq!(report.failed_count(), 2);
    assert!(!report.is_success());
    assert!(!store.calls().contains(&StoreCall::Begin));
}

#[tokio::test]
async fn test_bad_record_does_not_block_the_rest() {
    init_test_tracing();
    let server = MockServer::start().await;
    let document = kml_document(
        &[
            point("a", "1,1"),
            point("b", "2,2"),
            point("broken", "abc"),
            line("c", "0,0 1,1"),
            point("d", "3,3"),
        ]
        .concat(),
    );
    serve_kmz(&server, "/mixed.kmz", kmz_bytes(&[("doc.kml", &document)])).await;

    let store = MemoryStore::with_table(TABLE);
    let sources = vec![source("mixed", &format!("{}/mixed.kmz", server.uri()))];

    let report = orchestrator(&store).run(&sources).await.unwrap();

    assert!(report.is_success());
    match &report.sources[0].status {
        SourceStatus::Succeeded(outcome) => {
            assert_eq!(outcome.attempted, 5);
            assert_eq!(outcome.inserted, 4);
            assert_eq!(outcome.failed, 1);
            assert!(outcome.failure_samples[0].contains("broken"));
        },
        other => panic!("expected success, got {:?}", other),
    }

    let names: Vec<_> = store
        .rows(TABLE)
        .into_iter()
        .filter_map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_rerun_appends_rows() {
    let server = MockServer::start().await;
    serve_kmz(&server, "/s1.kmz", kmz_bytes(&[("doc.kml", &three_shape_document())])).await;

    let store = MemoryStore::with_table(TABLE);
    let sources = vec![source("s1", &format!("{}/s1.kmz", server.uri()))];
    let orchestrator = orchestrator(&store);

    orchestrator.run(&sources).await.unwrap();
    let second = orchestrator.run(&sources).await.unwrap();

    assert_eq!(store.rows(TABLE).len(), 6);
    match &second.sources[0].status {
        SourceStatus::Succeeded(outcome) => assert_eq!(outcome.total_rows, Some(6)),
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_extension_is_created_before_any_insert() {
    let server = MockServer::start().await;
    serve_kmz(&server, "/s1.kmz", kmz_bytes(&[("doc.kml", &three_shape_document())])).await;

    let store = MemoryStore::new(ExtensionState::Creatable);
    store.create_table(TABLE);
    let sources = vec![source("s1", &format!("{}/s1.kmz", server.uri()))];

    orchestrator(&store).run(&sources).await.unwrap();

    let calls = store.calls();
    let position = |needle: &StoreCall| calls.iter().position(|c| c == needle).unwrap();
    let create = position(&StoreCall::CreateExtension);
    let table_check = position(&StoreCall::TableExists(TABLE.to_string()));
    let first_insert = calls
        .iter()
        .position(|c| matches!(c, StoreCall::Insert { .. }))
        .unwrap();

    assert!(create < table_check);
    assert!(table_check < first_insert);
    assert_eq!(store.rows(TABLE).len(), 3);
}

#[tokio::test]
async fn test_missing_table_aborts_before_fetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = MemoryStore::default();
    let sources = vec![source("s1", &format!("{}/s1.kmz", server.uri()))];

    let err = orchestrator(&store).run(&sources).await.unwrap_err();

    assert!(matches!(err, PipelineError::MissingSchema { .. }));
    assert!(err.is_run_fatal());
}

#[tokio::test]
async fn test_unavailable_extension_aborts_run() {
    let store = MemoryStore::new(ExtensionState::Unavailable);
    store.create_table(TABLE);

    let err = orchestrator(&store)
        .run(&[source("s1", "http://127.0.0.1:9/s1.kmz")])
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ExtensionUnavailable { .. }));
    assert!(!store.calls().contains(&StoreCall::Begin));
}

#[tokio::test]
async fn test_corrupt_and_empty_archives_fail_their_source_only() {
    init_test_tracing();
    let server = MockServer::start().await;
    serve_kmz(&server, "/corrupt.kmz", b"definitely not a zip".to_vec()).await;
    serve_kmz(&server, "/assets.kmz", kmz_bytes(&[("icon.txt", "no markup")])).await;
    serve_kmz(&server, "/good.kmz", kmz_bytes(&[("doc.kml", &three_shape_document())])).await;

    let store = MemoryStore::with_table(TABLE);
    let sources = vec![
        source("corrupt", &format!("{}/corrupt.kmz", server.uri())),
        source("assets", &format!("{}/assets.kmz", server.uri())),
        source("good", &format!("{}/good.kmz", server.uri())),
    ];

    let report = orchestrator(&store).run(&sources).await.unwrap();

    let stages: Vec<_> = report
        .sources
        .iter()
        .map(|s| match &s.status {
            SourceStatus::Failed { stage, .. } => Some(*stage),
            SourceStatus::Succeeded(_) => None,
        })
        .collect();
    assert_eq!(stages, vec![Some(Stage::Extract), Some(Stage::Extract), None]);
    assert_eq!(store.rows(TABLE).len(), 3);
}

#[tokio::test]
async fn test_malformed_markup_is_a_parse_failure() {
    let server = MockServer::start().await;
    serve_kmz(
        &server,
        "/bad.kmz",
        kmz_bytes(&[("doc.kml", "<kml xmlns=\"http://www.opengis.net/kml/2.2\"><Document>")]),
    )
    .await;

    let store = MemoryStore::with_table(TABLE);
    let report = orchestrator(&store)
        .run(&[source("bad", &format!("{}/bad.kmz", server.uri()))])
        .await
        .unwrap();

    assert!(matches!(
        report.sources[0].status,
        SourceStatus::Failed { stage: Stage::Parse, .. }
    ));
    assert!(store.rows(TABLE).is_empty());
}

#[tokio::test]
async fn test_unusable_placemarks_are_dropped() {
    let server = MockServer::start().await;
    let document = kml_document(
        &[
            point("kept", "5,5"),
            "<Placemark><name>empty</name><Point><coordinates>   </coordinates></Point></Placemark>"
                .to_string(),
            "<Placemark><name>multi</name><MultiGeometry><Point><coordinates>1,1</coordinates></Point></MultiGeometry></Placemark>"
                .to_string(),
            "<Placemark><name>no geometry</name></Placemark>".to_string(),
            polygon("ring", "0,0 2,0 2,2 0,0"),
        ]
        .concat(),
    );
    serve_kmz(&server, "/drops.kmz", kmz_bytes(&[("doc.kml", &document)])).await;

    let store = MemoryStore::with_table(TABLE);
    let report = orchestrator(&store)
        .run(&[source("drops", &format!("{}/drops.kmz", server.uri()))])
        .await
        .unwrap();

    match &report.sources[0].status {
        SourceStatus::Succeeded(outcome) => {
            assert_eq!(outcome.attempted, 2);
            assert_eq!(outcome.inserted, 2);
        },
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_source_list_succeeds() {
    let store = MemoryStore::with_table(TABLE);
    let report = orchestrator(&store).run(&[]).await.unwrap();

    assert!(report.is_success());
    assert!(report.sources.is_empty());
    assert_eq!(store.calls().last(), Some(&StoreCall::TableExists(TABLE.to_string())));
}
