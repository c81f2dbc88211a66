use log::error;
use tokio_postgres::{Client, NoTls};

use crate::config::JobConfig;
use crate::error::LoadError;

/// Connection factory for the target database.  Built once at startup from
/// the job configuration and reused for the whole run.
pub struct DbEngine {
    config: tokio_postgres::Config,
}

impl DbEngine {
    pub fn new(job: &JobConfig) -> DbEngine {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&job.host_name)
            .port(job.port)
            .user(&job.user_name)
            .password(&job.user_password)
            .dbname(&job.database);
        DbEngine { config }
    }

    /// Open a fresh session.  Every table-load attempt gets its own client,
    /// because a statement that fails mid-transaction can leave the session
    /// unusable for further statements.  Dropping the client closes it.
    pub async fn connect(&self) -> Result<Client, LoadError> {
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| LoadError::Connection(describe(&e)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("database connection task ended with: {}", e);
            }
        });
        Ok(client)
    }
}

/// Prefer the server-side message over the driver's wrapper text.
pub fn describe(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    }
}
