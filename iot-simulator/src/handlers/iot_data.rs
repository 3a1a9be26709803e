use axum::Json;
use iot_common::record::RawReading;
use tracing::debug;

use crate::model::generate;

pub async fn get() -> Json<RawReading> {
    let now = chrono::Local::now().naive_local();
    let reading = generate(&mut rand::thread_rng(), now);

    metrics::counter!("iot_simulator_readings_total").increment(1);
    debug!(?reading, "generated reading");

    Json(reading)
}
