//! Migration history entity - one row per migration the external tool has applied.
//! The lifecycle manager only reads it: a table with at least one row means the
//! data store has committed schema history.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Migration history row
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migrations")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i32,
    /// Migration name (e.g., `"2024_01_01_000000_create_users_table"`)
    pub migration: String,
    /// Batch number the migration was applied in
    pub batch: i32,
}

/// Migration history has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
