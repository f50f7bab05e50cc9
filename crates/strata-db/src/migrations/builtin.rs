//! Built-in migrations establishing the order catalog: users own orders,
//! and orders relate to products through `order_products` line items.

use super::definition::MigrationDefinition;
use super::operation::SchemaOperation;
use crate::schema::{Column, ColumnType};

pub const CREATE_USERS: u64 = 20240115093000;
pub const CREATE_ORDERS: u64 = 20240115093100;
pub const CREATE_PRODUCTS: u64 = 20240115093200;
pub const CREATE_ORDER_PRODUCTS: u64 = 20240115093300;

pub fn definitions() -> Vec<MigrationDefinition> {
    vec![
        MigrationDefinition::reversible(
            CREATE_USERS,
            "create_users",
            vec![SchemaOperation::create_table(
                "users",
                vec![Column::new("name", ColumnType::Text)],
            )],
        ),
        MigrationDefinition::reversible(
            CREATE_ORDERS,
            "create_orders",
            vec![
                SchemaOperation::create_table(
                    "orders",
                    vec![
                        Column::new("date", ColumnType::Date),
                        Column::reference("user_id", "users"),
                    ],
                ),
                SchemaOperation::add_index("orders", &["user_id"]),
            ],
        ),
        MigrationDefinition::reversible(
            CREATE_PRODUCTS,
            "create_products",
            vec![SchemaOperation::create_table(
                "products",
                vec![
                    Column::new("name", ColumnType::Text),
                    Column::new("cost", ColumnType::Decimal),
                ],
            )],
        ),
        MigrationDefinition::reversible(
            CREATE_ORDER_PRODUCTS,
            "create_order_products",
            vec![
                SchemaOperation::create_table(
                    "order_products",
                    vec![
                        Column::reference("order_id", "orders"),
                        Column::reference("product_id", "products"),
                        Column::new("packed", ColumnType::Boolean).default_value("0"),
                    ],
                ),
                SchemaOperation::add_index("order_products", &["order_id"]),
                SchemaOperation::add_index("order_products", &["product_id"]),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaSnapshot, lint, validate};

    fn folded() -> SchemaSnapshot {
        let mut snapshot = SchemaSnapshot::new();
        for def in definitions() {
            for op in &def.up {
                op.apply_to(&mut snapshot).unwrap();
            }
        }
        snapshot
    }

    #[test]
    fn catalog_versions_ascend() {
        let versions: Vec<u64> = definitions().iter().map(|d| d.version.get()).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn catalog_schema_is_valid_and_fully_indexed() {
        let snapshot = folded();
        assert_eq!(validate(&snapshot), Ok(()));
        assert!(lint(&snapshot).is_empty(), "{:?}", lint(&snapshot));
    }

    #[test]
    fn join_table_has_no_direct_link_between_orders_and_products() {
        let snapshot = folded();
        let orders = snapshot.table("orders").unwrap();
        let products = snapshot.table("products").unwrap();
        assert!(orders.foreign_keys().all(|(_, r)| r.table != "products"));
        assert!(products.foreign_keys().next().is_none());

        let join = snapshot.table("order_products").unwrap();
        let targets: Vec<&str> = join.foreign_keys().map(|(_, r)| r.table.as_str()).collect();
        assert_eq!(targets, vec!["orders", "products"]);
    }
}
