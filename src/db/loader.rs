use chrono::NaiveDateTime;
use itertools::Itertools;
use log::{info, warn};
use tokio_postgres::Client;

use crate::dataset::{derive_hour_timestamps, Dataset, Value};
use crate::db::analiza;
use crate::db::engine::{describe, DbEngine};
use crate::error::LoadError;

/// Loads one dataset at a time into the store: creates the measurement table
/// on first load, appends rows on later loads, and links every table to the
/// analysis row (`analiza`, id = 1) through the `id_analizy` foreign key.
pub struct MeasurementLoader {
    pub engine: DbEngine,
}

impl MeasurementLoader {
    /// Load one dataset, with at most one sanitize-and-retry cycle: if the
    /// store rejects the data (non-finite values, typically), the dataset is
    /// replaced by its sanitized form and the whole decision logic re-runs
    /// on a fresh connection.  A second rejection is terminal for the table.
    pub async fn load(&self, dataset: &Dataset) -> Result<(), LoadError> {
        match self.attempt(dataset).await {
            Err(LoadError::SchemaRejection { table, cause }) => {
                warn!(
                    "table {}: store rejected the data ({}); retrying with non-finite values nulled",
                    table, cause
                );
                let cleaned = dataset.sanitized();
                settle_retry(self.attempt(&cleaned).await)
            }
            other => other,
        }
    }

    /// One pass of the decision logic, on its own connection.  An existing
    /// table that already carries an index gets the append path; an absent
    /// table, or one left indexless by an earlier interrupted load, is
    /// (re)created from scratch.
    async fn attempt(&self, dataset: &Dataset) -> Result<(), LoadError> {
        let client = self.engine.connect().await?;
        let table = dataset.table_name();
        let exists = has_table(&client, &table)
            .await
            .map_err(|e| classify(&table, "inspect schema", &e))?;
        let indexed = if exists {
            index_count(&client, &table)
                .await
                .map_err(|e| classify(&table, "inspect schema", &e))?
                > 0
        } else {
            false
        };
        if exists && indexed {
            self.append(&client, dataset, &table).await
        } else {
            self.create(&client, dataset, &table).await
        }
    }

    async fn append(
        &self,
        client: &Client,
        dataset: &Dataset,
        table: &str,
    ) -> Result<(), LoadError> {
        let start = analiza::start_date_time(client, table).await?;
        let stamps = derive_hour_timestamps(dataset, start)?;
        if !dataset.rows.is_empty() {
            let sql = insert_sql(table, dataset, &stamps, true)?;
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| classify(table, "append", &e))?;
        }
        info!("appended {} rows to table {}", dataset.rows.len(), table);
        Ok(())
    }

    async fn create(
        &self,
        client: &Client,
        dataset: &Dataset,
        table: &str,
    ) -> Result<(), LoadError> {
        let start = analiza::start_date_time(client, table).await?;
        let stamps = derive_hour_timestamps(dataset, start)?;

        // Full replace: a same-named table without an index is a leftover
        // from an interrupted load and is overwritten, not merged into.
        let mut write = create_table_sql(table, dataset);
        if !dataset.rows.is_empty() {
            write.push('\n');
            write.push_str(&insert_sql(table, dataset, &stamps, false)?);
        }
        client
            .batch_execute(&write)
            .await
            .map_err(|e| classify(table, "create", &e))?;

        for statement in [
            add_primary_key_sql(table),
            add_foreign_key_sql(table),
            fill_foreign_key_sql(table),
        ] {
            client
                .batch_execute(&statement)
                .await
                .map_err(|e| classify(table, "create", &e))?;
        }
        info!("created table {} with {} rows", table, dataset.rows.len());
        Ok(())
    }
}

/// Outcome of the post-sanitization attempt.  A second rejection is never
/// retried again; it becomes terminal for the table.
fn settle_retry(result: Result<(), LoadError>) -> Result<(), LoadError> {
    match result {
        Err(LoadError::SchemaRejection { table, cause }) => Err(LoadError::LoadFailed {
            table,
            operation: "sanitized retry".to_string(),
            cause,
        }),
        other => other,
    }
}

async fn has_table(client: &Client, table: &str) -> Result<bool, tokio_postgres::Error> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
            &[&table],
        )
        .await?;
    Ok(row.get(0))
}

async fn index_count(client: &Client, table: &str) -> Result<i64, tokio_postgres::Error> {
    let row = client
        .query_one(
            "SELECT count(*) FROM pg_indexes \
             WHERE schemaname = 'public' AND tablename = $1",
            &[&table],
        )
        .await?;
    Ok(row.get(0))
}

/// SQLSTATE classes that trigger the sanitize-and-retry cycle: data
/// exceptions (22xxx, e.g. a value out of range) and syntax/access-rule
/// violations (42xxx, how an unquotable non-finite literal surfaces).
fn is_schema_rejection(code: &str) -> bool {
    code.starts_with("22") || code.starts_with("42")
}

fn classify(table: &str, operation: &str, err: &tokio_postgres::Error) -> LoadError {
    if let Some(state) = err.code() {
        if is_schema_rejection(state.code()) {
            return LoadError::SchemaRejection {
                table: table.to_string(),
                cause: describe(err),
            };
        }
    }
    LoadError::LoadFailed {
        table: table.to_string(),
        operation: operation.to_string(),
        cause: describe(err),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQL type for one column, inferred from its values: text wins over float,
/// float over integer; an all-null column is stored as a float column.
fn column_sql_type(dataset: &Dataset, index: usize) -> &'static str {
    let mut has_float = false;
    let mut has_int = false;
    for row in &dataset.rows {
        match &row[index] {
            Value::Text(_) => return "TEXT",
            Value::Float(_) => has_float = true,
            Value::Int(_) => has_int = true,
            Value::Null => {}
        }
    }
    if has_float || !has_int {
        "DOUBLE PRECISION"
    } else {
        "BIGINT"
    }
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(i) => i.to_string(),
        // A non-finite float renders as a bare inf/-inf token the store
        // cannot parse; that rejection is what the sanitize-retry handles.
        Value::Float(x) => format!("{}", x),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn timestamp_literal(stamp: &NaiveDateTime) -> String {
    format!("'{}'", stamp.format("%Y-%m-%d %H:%M:%S"))
}

fn create_table_sql(table: &str, dataset: &Dataset) -> String {
    let columns = dataset
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{} {}", quote_ident(name), column_sql_type(dataset, i)))
        .join(", ");
    format!(
        "DROP TABLE IF EXISTS {table};\n\
         CREATE TABLE {table} ({columns}, hour_date_time TIMESTAMP);"
    )
}

/// One multi-row INSERT carrying the original columns plus the derived
/// `hour_date_time`; the append path also fills `id_analizy = 1` directly.
/// The timestamp vector must line up with the rows one to one.
fn insert_sql(
    table: &str,
    dataset: &Dataset,
    stamps: &[NaiveDateTime],
    with_analysis_id: bool,
) -> Result<String, LoadError> {
    if stamps.len() != dataset.rows.len() {
        return Err(LoadError::LoadFailed {
            table: table.to_string(),
            operation: "align timestamps".to_string(),
            cause: format!(
                "{} derived timestamps for {} rows",
                stamps.len(),
                dataset.rows.len()
            ),
        });
    }
    let mut columns: Vec<String> = dataset.columns.iter().map(|c| quote_ident(c)).collect();
    columns.push("hour_date_time".to_string());
    if with_analysis_id {
        columns.push("id_analizy".to_string());
    }
    let tuples = dataset
        .rows
        .iter()
        .zip(stamps)
        .map(|(row, stamp)| {
            let mut cells: Vec<String> = row.iter().map(sql_literal).collect();
            cells.push(timestamp_literal(stamp));
            if with_analysis_id {
                cells.push("1".to_string());
            }
            format!("({})", cells.join(", "))
        })
        .join(",\n");
    Ok(format!(
        "INSERT INTO {} ({}) VALUES\n{};",
        table,
        columns.join(", "),
        tuples
    ))
}

fn add_primary_key_sql(table: &str) -> String {
    format!(
        "ALTER TABLE {table} \
         ADD COLUMN \"ID\" INTEGER GENERATED BY DEFAULT AS IDENTITY, \
         ADD CONSTRAINT pk_{table} PRIMARY KEY (\"ID\");"
    )
}

fn add_foreign_key_sql(table: &str) -> String {
    format!(
        "ALTER TABLE {table} \
         ADD COLUMN id_analizy INTEGER, \
         ADD CONSTRAINT \"FK_Analiza{table}\" FOREIGN KEY (id_analizy) \
         REFERENCES analiza (id);"
    )
}

fn fill_foreign_key_sql(table: &str) -> String {
    format!("UPDATE {table} SET id_analizy = 1;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use chrono::NaiveDate;
    use std::error::Error;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn temp_dataset() -> Dataset {
        let csv = "h,v\nH1,10.0\nH2,20.0\n";
        Dataset::from_reader("Temp", csv.as_bytes()).unwrap()
    }

    #[test]
    fn create_table_statement() {
        let ds = temp_dataset();
        assert_eq!(
            create_table_sql("temp", &ds),
            "DROP TABLE IF EXISTS temp;\n\
             CREATE TABLE temp (\"h\" TEXT, \"v\" DOUBLE PRECISION, hour_date_time TIMESTAMP);"
        );
    }

    #[test]
    fn insert_statement_create_path() -> Result<(), Box<dyn Error>> {
        let ds = temp_dataset();
        let stamps = derive_hour_timestamps(&ds, start())?;
        let sql = insert_sql("temp", &ds, &stamps, false)?;
        assert_eq!(
            sql,
            "INSERT INTO temp (\"h\", \"v\", hour_date_time) VALUES\n\
             ('H1', 10, '2024-01-01 00:00:00'),\n\
             ('H2', 20, '2024-01-01 01:00:00');"
        );
        Ok(())
    }

    #[test]
    fn insert_statement_append_path() -> Result<(), Box<dyn Error>> {
        let ds = temp_dataset();
        let stamps = derive_hour_timestamps(&ds, start())?;
        let sql = insert_sql("temp", &ds, &stamps, true)?;
        assert!(sql.contains("id_analizy"));
        assert!(sql.contains("('H1', 10, '2024-01-01 00:00:00', 1)"));
        assert!(sql.contains("('H2', 20, '2024-01-01 01:00:00', 1);"));
        Ok(())
    }

    #[test]
    fn misaligned_timestamps_are_rejected() {
        let ds = temp_dataset();
        let stamps = vec![start()];
        match insert_sql("temp", &ds, &stamps, false) {
            Err(LoadError::LoadFailed { operation, .. }) => {
                assert_eq!(operation, "align timestamps");
            }
            other => panic!("expected LoadFailed, got {:?}", other),
        }
    }

    #[test]
    fn constraint_names_embed_the_table_name() {
        assert!(add_primary_key_sql("temp").contains("ADD CONSTRAINT pk_temp PRIMARY KEY (\"ID\")"));
        assert!(add_foreign_key_sql("temp").contains("ADD CONSTRAINT \"FK_Analizatemp\""));
        assert!(add_foreign_key_sql("temp").contains("REFERENCES analiza (id)"));
        assert_eq!(fill_foreign_key_sql("temp"), "UPDATE temp SET id_analizy = 1;");
    }

    #[test]
    fn non_finite_values_render_as_unquotable_tokens() {
        assert_eq!(sql_literal(&Value::Float(f64::INFINITY)), "inf");
        assert_eq!(sql_literal(&Value::Float(f64::NEG_INFINITY)), "-inf");
        assert_eq!(sql_literal(&Value::Float(2.5)), "2.5");
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&Value::Text("it's".to_string())), "'it''s'");
    }

    #[test]
    fn column_type_inference() {
        let csv = "h,a,b,c,d\nH1,1,1.5,x,\nH2,2,,y,\n";
        let ds = Dataset::from_reader("Temp", csv.as_bytes()).unwrap();
        assert_eq!(column_sql_type(&ds, 0), "TEXT");
        assert_eq!(column_sql_type(&ds, 1), "BIGINT");
        assert_eq!(column_sql_type(&ds, 2), "DOUBLE PRECISION");
        assert_eq!(column_sql_type(&ds, 3), "TEXT");
        assert_eq!(column_sql_type(&ds, 4), "DOUBLE PRECISION");
    }

    #[test]
    fn second_rejection_is_terminal() {
        let again = Err(LoadError::SchemaRejection {
            table: "temp".to_string(),
            cause: "syntax error at or near \"inf\"".to_string(),
        });
        match settle_retry(again) {
            Err(LoadError::LoadFailed {
                table, operation, ..
            }) => {
                assert_eq!(table, "temp");
                assert_eq!(operation, "sanitized retry");
            }
            other => panic!("expected LoadFailed, got {:?}", other),
        }
        assert!(settle_retry(Ok(())).is_ok());
        // Non-schema errors pass through unchanged.
        match settle_retry(Err(LoadError::MissingReference {
            table: "temp".to_string(),
        })) {
            Err(LoadError::MissingReference { table }) => assert_eq!(table, "temp"),
            other => panic!("expected MissingReference, got {:?}", other),
        }
    }

    #[test]
    fn schema_rejection_classes() {
        assert!(is_schema_rejection("22003")); // numeric value out of range
        assert!(is_schema_rejection("42601")); // syntax error
        assert!(!is_schema_rejection("23505")); // unique violation
        assert!(!is_schema_rejection("08006")); // connection failure
    }

    // Creating a table from the first half of a dataset and appending the
    // second half must produce the same row values as one whole-dataset
    // create (same timestamps, same id_analizy).
    #[test]
    fn create_then_append_covers_the_same_rows() -> Result<(), Box<dyn Error>> {
        let csv = "h,v\nH1,10.0\nH2,20.0\nH3,30.0\nH4,40.0\n";
        let whole = Dataset::from_reader("Temp", csv.as_bytes())?;
        let mut first = whole.clone();
        let mut second = whole.clone();
        first.rows.truncate(2);
        second.rows.drain(0..2);

        let whole_stamps = derive_hour_timestamps(&whole, start())?;
        let first_stamps = derive_hour_timestamps(&first, start())?;
        let second_stamps = derive_hour_timestamps(&second, start())?;
        assert_eq!(
            whole_stamps,
            [first_stamps.clone(), second_stamps.clone()].concat()
        );

        let tuples = |sql: String| -> Vec<String> {
            sql.lines()
                .filter(|l| l.starts_with('('))
                .map(|l| l.trim_end_matches([',', ';']).to_string())
                .collect()
        };
        let whole_rows = tuples(insert_sql("temp", &whole, &whole_stamps, true)?);
        let mut split_rows = tuples(insert_sql("temp", &first, &first_stamps, true)?);
        split_rows.extend(tuples(insert_sql("temp", &second, &second_stamps, true)?));
        assert_eq!(whole_rows, split_rows);
        Ok(())
    }

    /// Needs a local PostgreSQL with the analiza table seeded:
    ///   CREATE TABLE analiza (id INT PRIMARY KEY, start_date_time TIMESTAMP);
    ///   INSERT INTO analiza VALUES (1, '2024-01-01 00:00:00');
    #[ignore]
    #[tokio::test]
    async fn load_temp_table() -> Result<(), Box<dyn Error>> {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .try_init();
        let config = JobConfig::from_path("config.json")?;
        let loader = MeasurementLoader {
            engine: DbEngine::new(&config),
        };
        let ds = temp_dataset();
        loader.load(&ds).await?;
        // Second run takes the append path.
        loader.load(&ds).await?;
        Ok(())
    }

    /// Needs a local PostgreSQL seeded like `load_temp_table`.  The inf cell
    /// makes the store reject the first attempt; after the one sanitized
    /// retry the value must land as NULL and the other rows intact.
    #[ignore]
    #[tokio::test]
    async fn non_finite_value_lands_as_null_after_retry() -> Result<(), Box<dyn Error>> {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .try_init();
        let config = JobConfig::from_path("config.json")?;
        let loader = MeasurementLoader {
            engine: DbEngine::new(&config),
        };
        let csv = "h,v\nH1,inf\nH2,20.0\n";
        let ds = Dataset::from_reader("TempInf", csv.as_bytes())?;
        loader.load(&ds).await?;

        let client = loader.engine.connect().await?;
        let row = client
            .query_one("SELECT v FROM tempinf WHERE h = 'H1'", &[])
            .await?;
        assert_eq!(row.get::<usize, Option<f64>>(0), None);
        let row = client
            .query_one("SELECT v FROM tempinf WHERE h = 'H2'", &[])
            .await?;
        assert_eq!(row.get::<usize, Option<f64>>(0), Some(20.0));
        let row = client.query_one("SELECT count(*) FROM tempinf", &[]).await?;
        assert_eq!(row.get::<usize, i64>(0), 2);
        client.batch_execute("DROP TABLE tempinf;").await?;
        Ok(())
    }

    /// Needs a database where the analiza table exists but holds no row
    /// with id = 1 (e.g. a freshly created scratch database).  The load
    /// must surface the missing reference, naming the dataset's table, and
    /// must not create anything.
    #[ignore]
    #[tokio::test]
    async fn missing_analysis_row_is_surfaced() -> Result<(), Box<dyn Error>> {
        let config = JobConfig::from_path("config.json")?;
        let loader = MeasurementLoader {
            engine: DbEngine::new(&config),
        };
        let ds = temp_dataset();
        match loader.load(&ds).await {
            Err(LoadError::MissingReference { table }) => assert_eq!(table, "temp"),
            other => panic!("expected MissingReference, got {:?}", other),
        }
        let client = loader.engine.connect().await?;
        assert!(!has_table(&client, "temp").await?);
        Ok(())
    }
}
