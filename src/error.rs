use thiserror::Error;

/// Everything that can go wrong while loading one dataset into the store.
///
/// Only `Connection` aborts the whole job; every other variant is terminal
/// for the current table and the job moves on to the next one.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot reach the database: {0}")]
    Connection(String),

    #[error("table {table}: analiza has no row with id = 1")]
    MissingReference { table: String },

    #[error("table {table}: malformed hour label '{value}'")]
    MalformedInput { table: String, value: String },

    #[error("table {table}: store rejected the data: {cause}")]
    SchemaRejection { table: String, cause: String },

    #[error("table {table}: {operation} failed: {cause}")]
    LoadFailed {
        table: String,
        operation: String,
        cause: String,
    },
}
