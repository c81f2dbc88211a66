use serde::Deserialize;
use std::env;
use std::error::Error;
use std::fs;
use std::path::Path;

fn default_port() -> u16 {
    5432
}

fn default_csv_dir() -> String {
    ".".to_string()
}

/// Job configuration, read from a JSON document.  One entry in
/// `list_of_tables` corresponds to one CSV file under `csv_dir` and to one
/// measurement table in the database.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub host_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user_name: String,
    pub user_password: String,
    pub database: String,
    pub list_of_tables: Vec<String>,
    #[serde(default = "default_csv_dir")]
    pub csv_dir: String,
}

impl JobConfig {
    /// Read the configuration file.  The `ANALIZA_DB_PASSWORD` environment
    /// variable, when set (usually via a .env file), takes precedence over
    /// the password stored in the document.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<JobConfig, Box<dyn Error>> {
        let buffer = fs::read_to_string(path)?;
        let mut config: JobConfig = serde_json::from_str(&buffer)?;
        if let Ok(password) = env::var("ANALIZA_DB_PASSWORD") {
            config.user_password = password;
        }
        Ok(config)
    }

    /// Conventional location of the CSV file for a dataset name.
    pub fn csv_path(&self, name: &str) -> String {
        format!("{}/{}.csv", self.csv_dir, name)
    }
}
