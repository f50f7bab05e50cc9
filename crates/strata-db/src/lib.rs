pub mod database;
pub mod entities;
pub mod migrations;
pub mod relations;
pub mod resolver;
pub mod schema;

pub use database::Database;
pub use entities::{Entity, LineItem, Order, OrderProduct, Product, User};
pub use migrations::{
    MigrationDefinition, MigrationLedger, MigrationRecord, MigrationRegistry, MigrationReport,
    MigrationRunner, MigrationStatus, MigrationVersion, SchemaOperation,
};
pub use relations::Relation;
pub use resolver::RelationshipResolver;
pub use schema::{Column, ColumnType, SchemaError, SchemaSnapshot, SchemaWarning};
