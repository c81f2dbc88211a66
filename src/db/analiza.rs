use chrono::NaiveDateTime;
use tokio_postgres::Client;

use crate::db::engine::describe;
use crate::error::LoadError;

/// Read the reference start time of the analysis.  Every derived
/// `hour_date_time` hangs off this value, so the row must pre-exist; its
/// absence is a setup error and is never defaulted.  Errors carry the name
/// of the measurement table whose load was in progress.
pub async fn start_date_time(client: &Client, table: &str) -> Result<NaiveDateTime, LoadError> {
    let rows = client
        .query("SELECT start_date_time FROM analiza WHERE id = 1", &[])
        .await
        .map_err(|e| LoadError::LoadFailed {
            table: table.to_string(),
            operation: "resolve start time".to_string(),
            cause: describe(&e),
        })?;
    match rows.first() {
        Some(row) => Ok(row.get(0)),
        None => Err(LoadError::MissingReference {
            table: table.to_string(),
        }),
    }
}
