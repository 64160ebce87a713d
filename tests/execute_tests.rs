/// Executor tests
///
/// Collection resolution, error propagation and consistency modes through `execute`
/// Run with: cargo test --test execute_tests

use docsession::connection::NodeRole;
use docsession::{
    Collection, DbAction, Document, MemoryReplicaSet, OptionalExt, SessionError, SessionManager,
    StoreConfig, StoreError, execute,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;

const DATABASE: &str = "test";
const STATIONS: &str = "buoy_stations";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Station {
    station_id: String,
    name: String,
    region: String,
}

fn station(id: &str, name: &str, region: &str) -> Station {
    Station {
        station_id: id.to_string(),
        name: name.to_string(),
        region: region.to_string(),
    }
}

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn seeded_set() -> MemoryReplicaSet {
    let set = MemoryReplicaSet::new()
        .with_primary("localhost:27017")
        .with_secondary("localhost:27018");
    set.seed(
        DATABASE,
        STATIONS,
        vec![
            doc(json!({"station_id": "42002", "name": "West Gulf", "region": "Gulf Of Mexico"})),
            doc(json!({"station_id": "42036", "name": "West Tampa", "region": "Gulf Of Mexico"})),
            doc(json!({"station_id": "44013", "name": "Boston", "region": "Atlantic"})),
        ],
    )
    .unwrap();
    set
}

async fn started(set: &MemoryReplicaSet) -> SessionManager {
    let config = StoreConfig::new("localhost:27017,localhost:27018", DATABASE);
    let mut manager = SessionManager::with_config(set.clone(), config);
    manager.startup("test").await.unwrap();
    manager
}

#[derive(Debug, PartialEq, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Session(err.into())
    }
}

/// Lookup carrying its own parameters.
struct FindStation {
    station_id: String,
}

impl DbAction<Option<Station>, SessionError> for FindStation {
    fn run(
        self,
        collection: Collection,
    ) -> impl Future<Output = Result<Option<Station>, SessionError>> + Send {
        async move {
            let filter = doc(json!({"station_id": self.station_id}));
            Ok::<_, SessionError>(collection.find_one_as(filter).await.optional()?)
        }
    }
}

#[tokio::test]
async fn test_missing_key_maps_to_none() {
    let set = MemoryReplicaSet::new().with_primary("localhost:27017");
    let mut manager = SessionManager::with_config(set, StoreConfig::new("localhost:27017", "test"));
    manager.startup("test").await.unwrap();

    let mut handle = manager.copy_monotonic_session("test").unwrap();
    let found = execute("test", &handle, "test", STATIONS, |stations: Collection| async move {
        let missing = stations.find_one(doc(json!({"station_id": "00000"}))).await;
        Ok::<_, SessionError>(missing.optional()?)
    })
    .await
    .unwrap();
    assert_eq!(found, None);

    manager.close_session("test", Some(&mut handle));
}

#[tokio::test]
async fn test_missing_key_is_typed_sentinel() {
    let set = seeded_set();
    let manager = started(&set).await;
    let handle = manager.copy_master_session("test").unwrap();

    let err = execute("test", &handle, DATABASE, STATIONS, |stations: Collection| async move {
        Ok::<_, SessionError>(stations.find_one(doc(json!({"station_id": "00000"}))).await?)
    })
    .await
    .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err, SessionError::Store(StoreError::NotFound));
}

#[tokio::test]
async fn test_struct_action() {
    let set = seeded_set();
    let manager = started(&set).await;
    let handle = manager.copy_monotonic_session("test").unwrap();

    let found = execute(
        "test",
        &handle,
        DATABASE,
        STATIONS,
        FindStation {
            station_id: "42002".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(found, Some(station("42002", "West Gulf", "Gulf Of Mexico")));

    let missing = execute(
        "test",
        &handle,
        DATABASE,
        STATIONS,
        FindStation {
            station_id: "99999".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
async fn test_find_by_region() {
    let set = seeded_set();
    let manager = started(&set).await;
    let handle = manager.copy_monotonic_session("test").unwrap();

    let find_gulf = |stations: Collection| async move {
        let filter = doc(json!({"region": "Gulf Of Mexico"}));
        Ok::<_, SessionError>(stations.find_as::<Station>(filter).await?)
    };
    let gulf = execute("test", &handle, DATABASE, STATIONS, find_gulf).await.unwrap();

    let ids: Vec<&str> = gulf.iter().map(|s| s.station_id.as_str()).collect();
    assert_eq!(ids, vec!["42002", "42036"]);
}

#[tokio::test]
async fn test_action_error_is_unchanged() {
    let set = seeded_set();
    let manager = started(&set).await;
    let handle = manager.copy_master_session("test").unwrap();

    let err = execute("test", &handle, DATABASE, STATIONS, |_stations: Collection| async move {
        Err::<(), _>(AppError::Validation("station_id is required".to_string()))
    })
    .await
    .unwrap_err();

    assert_eq!(err, AppError::Validation("station_id is required".to_string()));
}

#[tokio::test]
async fn test_store_error_is_unchanged() {
    let set = seeded_set();
    let manager = started(&set).await;
    let handle = manager.copy_master_session("test").unwrap();

    let err = execute("test", &handle, DATABASE, STATIONS, |stations: Collection| async move {
        let id = doc(json!({"_id": "dup"}));
        stations.insert(id.clone()).await?;
        stations.insert(id).await?;
        Ok::<_, AppError>(())
    })
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        AppError::Session(SessionError::Store(StoreError::DuplicateKey(_)))
    ));
}

#[tokio::test]
async fn test_resolution_errors() {
    let set = seeded_set();
    let manager = started(&set).await;
    let mut handle = manager.copy_master_session("test").unwrap();

    let count = |stations: Collection| async move {
        Ok::<_, AppError>(stations.count(Document::new()).await?)
    };

    let bad_database = execute("test", &handle, "bad.db", STATIONS, count).await;
    assert!(matches!(
        bad_database,
        Err(AppError::Session(SessionError::Resolution { .. }))
    ));

    let bad_collection = execute("test", &handle, DATABASE, "$cmd", count).await;
    assert!(matches!(
        bad_collection,
        Err(AppError::Session(SessionError::Resolution { .. }))
    ));

    manager.close_session("test", Some(&mut handle));
    let closed = execute("test", &handle, DATABASE, STATIONS, count).await;
    match closed {
        Err(AppError::Session(SessionError::Resolution {
            database,
            collection,
            ..
        })) => {
            assert_eq!(database, DATABASE);
            assert_eq!(collection, STATIONS);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_monotonic_reads_own_writes() {
    let set = seeded_set().with_replication_lag();
    let manager = started(&set).await;
    let handle = manager.copy_monotonic_session("test").unwrap();

    let before = execute("test", &handle, DATABASE, STATIONS, |stations: Collection| async move {
        Ok::<_, SessionError>(stations.count(Document::new()).await?)
    })
    .await
    .unwrap();
    assert_eq!(before, 3);
    assert_eq!(
        handle.session().unwrap().reserved_role().await,
        Some(NodeRole::Secondary)
    );

    let after = execute("test", &handle, DATABASE, STATIONS, |stations: Collection| async move {
        stations
            .insert_as(&station("46042", "Monterey", "Pacific"))
            .await?;
        Ok::<_, SessionError>(stations.count(Document::new()).await?)
    })
    .await
    .unwrap();

    assert_eq!(after, 4);
    assert_eq!(
        handle.session().unwrap().reserved_role().await,
        Some(NodeRole::Primary)
    );
    // Not yet replicated.
    assert_eq!(
        set.documents_on("localhost:27018", DATABASE, STATIONS).unwrap().len(),
        3
    );
}

#[tokio::test]
async fn test_strong_handle_sees_other_handles_writes() {
    let set = seeded_set().with_replication_lag();
    let manager = started(&set).await;
    let writer = manager.copy_master_session("writer").unwrap();
    let reader = manager.copy_master_session("reader").unwrap();

    execute("writer", &writer, DATABASE, STATIONS, |stations: Collection| async move {
        Ok::<_, SessionError>(
            stations
                .update(
                    doc(json!({"station_id": "44013"})),
                    doc(json!({"$set": {"name": "Boston Harbor"}})),
                )
                .await?,
        )
    })
    .await
    .unwrap();

    let name = execute("reader", &reader, DATABASE, STATIONS, |stations: Collection| async move {
        let found: Station = stations.find_one_as(doc(json!({"station_id": "44013"}))).await?;
        Ok::<_, SessionError>(found.name)
    })
    .await
    .unwrap();

    assert_eq!(name, "Boston Harbor");
}

#[tokio::test]
async fn test_collection_exists() {
    let set = seeded_set();
    let manager = started(&set).await;
    let handle = manager.copy_master_session("test").unwrap();

    let session = handle.session().unwrap();
    let db = session.db(DATABASE).unwrap();
    assert!(db.collection_exists(STATIONS).await.unwrap());
    assert!(!db.collection_exists("buoy_readings").await.unwrap());
}
