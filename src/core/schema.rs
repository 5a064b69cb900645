//! Read-only schema inspection.
//!
//! Lists tables and columns for whichever backend the connection talks to,
//! and answers "has the migration tool ever committed anything here". Row
//! data is never read except for the migration history count.

use crate::{entities::Migration, errors::Result};
use sea_orm::{ConnectionTrait, DatabaseBackend, EntityTrait, PaginatorTrait, Statement};
use serde::Serialize;

/// One column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Declared type as reported by the engine
    #[serde(rename = "type")]
    pub data_type: String,
}

/// Table name plus its columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    /// Table name
    pub name: String,
    /// Columns in declaration order
    pub columns: Vec<ColumnInfo>,
}

/// Names of all user tables, sorted.
pub async fn list_tables<C: ConnectionTrait>(db: &C) -> Result<Vec<String>> {
    let backend = db.get_database_backend();
    let sql = match backend {
        DatabaseBackend::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        DatabaseBackend::MySql => {
            "SELECT table_name AS name FROM information_schema.tables WHERE table_schema = DATABASE() ORDER BY table_name"
        }
        DatabaseBackend::Postgres => {
            "SELECT table_name AS name FROM information_schema.tables WHERE table_schema = current_schema() ORDER BY table_name"
        }
    };
    let rows = db
        .query_all(Statement::from_string(backend, sql.to_string()))
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String>("", "name").map_err(Into::into))
        .collect()
}

/// Whether a table with this exact name exists.
pub async fn table_exists<C: ConnectionTrait>(db: &C, table: &str) -> Result<bool> {
    Ok(list_tables(db).await?.iter().any(|t| t == table))
}

/// Columns of one table in declaration order.
pub async fn table_columns<C: ConnectionTrait>(db: &C, table: &str) -> Result<Vec<ColumnInfo>> {
    let backend = db.get_database_backend();
    let sql = match backend {
        DatabaseBackend::Sqlite => "SELECT name, type FROM pragma_table_info(?)",
        DatabaseBackend::MySql => {
            "SELECT column_name AS name, column_type AS type FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ordinal_position"
        }
        DatabaseBackend::Postgres => {
            "SELECT column_name AS name, data_type AS type FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 ORDER BY ordinal_position"
        }
    };
    let rows = db
        .query_all(Statement::from_sql_and_values(backend, sql, [table.into()]))
        .await?;
    rows.iter()
        .map(|row| {
            Ok(ColumnInfo {
                name: row.try_get("", "name")?,
                data_type: row.try_get("", "type")?,
            })
        })
        .collect()
}

/// Structure of every table: names and columns, no row data.
pub async fn describe_schema<C: ConnectionTrait>(db: &C) -> Result<Vec<TableInfo>> {
    let mut tables = Vec::new();
    for name in list_tables(db).await? {
        let columns = table_columns(db, &name).await?;
        tables.push(TableInfo { name, columns });
    }
    Ok(tables)
}

/// Name of the migration history table (see [`crate::entities::migration`]).
pub const HISTORY_TABLE: &str = "migrations";

/// True when the migration history table exists and holds at least one row.
pub async fn has_schema_history<C: ConnectionTrait>(db: &C) -> Result<bool> {
    if !table_exists(db, HISTORY_TABLE).await? {
        return Ok(false);
    }
    Ok(Migration::find().count(db).await? > 0)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::create_history_table;
    use sea_orm::Database;

    #[tokio::test]
    async fn test_empty_database_has_no_history() -> Result<()> {
        let db = Database::connect("sqlite::memory:").await?;
        assert!(list_tables(&db).await?.is_empty());
        assert!(!has_schema_history(&db).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_history_requires_a_row() -> Result<()> {
        let db = Database::connect("sqlite::memory:").await?;
        create_history_table(&db).await?;
        assert!(table_exists(&db, "migrations").await?);
        assert!(!has_schema_history(&db).await?);

        db.execute_unprepared(
            "INSERT INTO migrations (migration, batch) VALUES ('2024_01_01_create_users', 1)",
        )
        .await?;
        assert!(has_schema_history(&db).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_describe_schema_lists_columns() -> Result<()> {
        let db = Database::connect("sqlite::memory:").await?;
        db.execute_unprepared("CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL)")
            .await?;
        db.execute_unprepared("INSERT INTO products (name, price) VALUES ('Coffee', 2.5)")
            .await?;

        let schema = describe_schema(&db).await?;
        assert_eq!(schema.len(), 1);
        assert_eq!(schema[0].name, "products");
        let names: Vec<&str> = schema[0].columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "price"]);
        assert_eq!(schema[0].columns[1].data_type, "TEXT");

        let json = serde_json::to_string(&schema)?;
        assert!(!json.contains("Coffee"));
        Ok(())
    }
}
