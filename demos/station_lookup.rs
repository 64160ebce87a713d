//! Buoy station lookups through a request scope.
//!
//! Run with: cargo run --example station_lookup
//! Set RUST_LOG=docsession=debug to see the session spans.

use docsession::logging::init_logging;
use docsession::{
    Collection, Document, MemoryReplicaSet, OptionalExt, ServiceScope, SessionError,
    SessionManager, StoreConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

const DATABASE: &str = "gotraining";
const STATIONS: &str = "buoy_stations";

#[derive(Debug, Serialize, Deserialize)]
struct BuoyCondition {
    wind_speed_milehour: f64,
    wind_direction_degnorth: i64,
    wind_gust_milehour: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BuoyStation {
    station_id: String,
    name: String,
    loc_desc: String,
    condition: BuoyCondition,
    region: String,
}

fn filter(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

async fn find_station(
    scope: &ServiceScope,
    station_id: &str,
) -> Result<Option<BuoyStation>, SessionError> {
    let query = filter(json!({"station_id": station_id}));
    scope
        .db_action(DATABASE, STATIONS, |stations: Collection| async move {
            Ok::<_, SessionError>(stations.find_one_as(query).await.optional()?)
        })
        .await
}

async fn find_region(scope: &ServiceScope, region: &str) -> Result<Vec<BuoyStation>, SessionError> {
    let query = filter(json!({"region": region}));
    scope
        .db_action(DATABASE, STATIONS, |stations: Collection| async move {
            Ok::<_, SessionError>(stations.find_as(query).await?)
        })
        .await
}

fn station(station_id: &str, name: &str, loc_desc: &str, region: &str, wind: f64) -> Document {
    filter(json!({
        "station_id": station_id,
        "name": name,
        "loc_desc": loc_desc,
        "condition": {
            "wind_speed_milehour": wind,
            "wind_direction_degnorth": 130,
            "wind_gust_milehour": wind * 1.3,
        },
        "region": region,
    }))
}

#[tokio::main]
async fn main() -> Result<(), SessionError> {
    init_logging("info");

    let store = MemoryReplicaSet::new()
        .with_primary("localhost:27017")
        .with_secondary("localhost:27018");
    store.seed(
        DATABASE,
        STATIONS,
        vec![
            station("42002", "West Gulf", "207 NM East of Brownsville, TX", "Gulf Of Mexico", 17.9),
            station("42036", "West Tampa", "106 NM WNW of Tampa, FL", "Gulf Of Mexico", 11.4),
            station("44013", "Boston", "16 NM East of Boston, MA", "Atlantic", 8.2),
        ],
    )?;

    let config = StoreConfig::new("localhost:27017,localhost:27018", DATABASE);
    let mut manager = SessionManager::with_config(store, config);
    manager.startup("main").await?;

    let mut scope = ServiceScope::prepare(&manager, "station-lookup")?;

    match find_station(&scope, "42002").await? {
        Some(station) => println!(
            "{} ({}): wind {} mph",
            station.name, station.station_id, station.condition.wind_speed_milehour
        ),
        None => println!("station 42002 not found"),
    }

    if find_station(&scope, "00000").await?.is_none() {
        println!("station 00000 not found");
    }

    for station in find_region(&scope, "Gulf Of Mexico").await? {
        println!("Gulf Of Mexico: {} - {}", station.station_id, station.loc_desc);
    }

    scope.finish();
    manager.shutdown("main")?;
    Ok(())
}
