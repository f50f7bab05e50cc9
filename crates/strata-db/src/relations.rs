//! Relationship descriptors between catalog tables.
//!
//! Each descriptor names the tables and foreign-key columns it traverses and
//! generates the query that resolves it. Descriptors are plain data; they
//! are checked against a [`SchemaSnapshot`] before the resolver uses them.

use crate::schema::{PRIMARY_KEY, SchemaError, SchemaSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// `table.foreign_key` points at one `target` row.
    BelongsTo {
        name: &'static str,
        table: &'static str,
        foreign_key: &'static str,
        target: &'static str,
    },
    /// Rows of `target` whose `foreign_key` points at one `table` row.
    HasMany {
        name: &'static str,
        table: &'static str,
        target: &'static str,
        foreign_key: &'static str,
    },
    /// Rows of `target` reached through a join table holding a foreign key
    /// to each side.
    HasManyThrough {
        name: &'static str,
        table: &'static str,
        through: &'static str,
        source_key: &'static str,
        target_key: &'static str,
        target: &'static str,
    },
}

pub const USER_ORDERS: Relation = Relation::HasMany {
    name: "user.orders",
    table: "users",
    target: "orders",
    foreign_key: "user_id",
};

pub const ORDER_USER: Relation = Relation::BelongsTo {
    name: "order.user",
    table: "orders",
    foreign_key: "user_id",
    target: "users",
};

pub const ORDER_PRODUCTS: Relation = Relation::HasManyThrough {
    name: "order.products",
    table: "orders",
    through: "order_products",
    source_key: "order_id",
    target_key: "product_id",
    target: "products",
};

pub const PRODUCT_ORDERS: Relation = Relation::HasManyThrough {
    name: "product.orders",
    table: "products",
    through: "order_products",
    source_key: "product_id",
    target_key: "order_id",
    target: "orders",
};

/// Every relationship of the order catalog.
pub fn catalog() -> [Relation; 4] {
    [USER_ORDERS, ORDER_USER, ORDER_PRODUCTS, PRODUCT_ORDERS]
}

impl Relation {
    pub fn name(&self) -> &'static str {
        match self {
            Relation::BelongsTo { name, .. }
            | Relation::HasMany { name, .. }
            | Relation::HasManyThrough { name, .. } => *name,
        }
    }

    /// Table whose row the relation starts from.
    pub fn source(&self) -> &'static str {
        match self {
            Relation::BelongsTo { table, .. }
            | Relation::HasMany { table, .. }
            | Relation::HasManyThrough { table, .. } => *table,
        }
    }

    /// Table whose rows the relation yields.
    pub fn target(&self) -> &'static str {
        match self {
            Relation::BelongsTo { target, .. }
            | Relation::HasMany { target, .. }
            | Relation::HasManyThrough { target, .. } => *target,
        }
    }

    /// Confirm every table exists and every traversed column is a foreign
    /// key to the expected table.
    pub fn check(&self, schema: &SchemaSnapshot) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidRelation {
            name: self.name().to_string(),
            reason,
        };
        let require_table = |table: &str| {
            if schema.has_table(table) {
                Ok(())
            } else {
                Err(invalid(format!("table {table} does not exist")))
            }
        };
        let require_fk = |table: &str, column: &str, references: &str| {
            let found = schema
                .table(table)
                .and_then(|t| t.column(column))
                .and_then(|c| c.references.as_ref());
            match found {
                Some(r) if r.table == references => Ok(()),
                _ => Err(invalid(format!(
                    "{table}.{column} is not a foreign key to {references}"
                ))),
            }
        };

        match *self {
            Relation::BelongsTo {
                table,
                foreign_key,
                target,
                ..
            } => {
                require_table(table)?;
                require_table(target)?;
                require_fk(table, foreign_key, target)
            }
            Relation::HasMany {
                table,
                target,
                foreign_key,
                ..
            } => {
                require_table(table)?;
                require_table(target)?;
                require_fk(target, foreign_key, table)
            }
            Relation::HasManyThrough {
                table,
                through,
                source_key,
                target_key,
                target,
                ..
            } => {
                require_table(table)?;
                require_table(through)?;
                require_table(target)?;
                require_fk(through, source_key, table)?;
                require_fk(through, target_key, target)
            }
        }
    }

    /// Query yielding the target rows for one source id bound as `?1`.
    /// `columns` are the target columns to select. Collections are ordered
    /// by id (by join row id for through relations).
    pub fn select_sql(&self, columns: &[&str]) -> String {
        let select = |table: &str| {
            columns
                .iter()
                .map(|c| format!("\"{table}\".\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match *self {
            Relation::BelongsTo {
                table,
                foreign_key,
                target,
                ..
            } => format!(
                "SELECT {} FROM \"{target}\" JOIN \"{table}\" \
                 ON \"{table}\".\"{foreign_key}\" = \"{target}\".\"{PRIMARY_KEY}\" \
                 WHERE \"{table}\".\"{PRIMARY_KEY}\" = ?1",
                select(target)
            ),
            Relation::HasMany {
                target,
                foreign_key,
                ..
            } => format!(
                "SELECT {} FROM \"{target}\" WHERE \"{target}\".\"{foreign_key}\" = ?1 \
                 ORDER BY \"{target}\".\"{PRIMARY_KEY}\"",
                select(target)
            ),
            Relation::HasManyThrough {
                through,
                source_key,
                target_key,
                target,
                ..
            } => format!(
                "SELECT {} FROM \"{through}\" JOIN \"{target}\" \
                 ON \"{target}\".\"{PRIMARY_KEY}\" = \"{through}\".\"{target_key}\" \
                 WHERE \"{through}\".\"{source_key}\" = ?1 \
                 ORDER BY \"{through}\".\"{PRIMARY_KEY}\"",
                select(target)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::builtin;

    fn catalog_schema() -> SchemaSnapshot {
        let mut snapshot = SchemaSnapshot::new();
        for def in builtin::definitions() {
            for op in &def.up {
                op.apply_to(&mut snapshot).unwrap();
            }
        }
        snapshot
    }

    #[test]
    fn catalog_relations_match_catalog_schema() {
        let schema = catalog_schema();
        for relation in catalog() {
            assert_eq!(relation.check(&schema), Ok(()), "{}", relation.name());
        }
    }

    #[test]
    fn missing_join_table_is_reported() {
        let mut schema = catalog_schema();
        schema.tables.remove("order_products");
        let err = ORDER_PRODUCTS.check(&schema).unwrap_err();
        assert!(
            matches!(&err, SchemaError::InvalidRelation { name, .. } if name == "order.products")
        );
        assert!(err.to_string().contains("order_products does not exist"));
        assert_eq!(USER_ORDERS.check(&schema), Ok(()));
    }

    #[test]
    fn wrong_foreign_key_target_is_reported() {
        let relation = Relation::BelongsTo {
            name: "order.product",
            table: "orders",
            foreign_key: "user_id",
            target: "products",
        };
        let err = relation.check(&catalog_schema()).unwrap_err();
        assert!(err.to_string().contains("orders.user_id is not a foreign key to products"));
    }

    #[test]
    fn through_query_orders_by_join_row() {
        let sql = ORDER_PRODUCTS.select_sql(&["id", "name"]);
        assert!(sql.starts_with(r#"SELECT "products"."id", "products"."name" FROM "order_products""#));
        assert!(sql.contains(r#"WHERE "order_products"."order_id" = ?1"#));
        assert!(sql.ends_with(r#"ORDER BY "order_products"."id""#));
    }
}
