//! Entity module - SeaORM entity definitions for the tables the lifecycle manager reads.
//! The schema itself belongs to the external migration tool.

pub mod migration;

pub use migration::{Column as MigrationColumn, Entity as Migration, Model as MigrationModel};
