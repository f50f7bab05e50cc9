use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::{OptionalExtension, ToSql, params};
use strata_common::{Error, Result};
use tracing::debug;

use crate::database::{Database, write_error};
use crate::entities::{Entity, LineItem, Order, OrderProduct, Product, User};
use crate::relations::{self, ORDER_PRODUCTS, ORDER_USER, PRODUCT_ORDERS, Relation, USER_ORDERS};
use crate::schema::SchemaSnapshot;

/// Reads and writes catalog entities and resolves the relationships
/// between them.
pub struct RelationshipResolver {
    db: Arc<Database>,
}

impl RelationshipResolver {
    /// Build a resolver after checking every catalog relation against
    /// `schema`, normally the snapshot returned by `MigrationRunner::verify`.
    pub fn new(db: Arc<Database>, schema: &SchemaSnapshot) -> Result<Self> {
        for relation in relations::catalog() {
            relation.check(schema)?;
        }
        Ok(Self { db })
    }

    pub fn create_user(&self, name: &str) -> Result<User> {
        let id = self.insert(
            "INSERT INTO users (name) VALUES (?1)",
            params![name],
            "failed to create user",
        )?;
        debug!("created user {id}");
        Ok(User {
            id,
            name: name.to_string(),
        })
    }

    /// Fails with `ConstraintViolation` when `user_id` names no user.
    pub fn create_order(&self, user_id: i64, date: NaiveDate) -> Result<Order> {
        let id = self.insert(
            "INSERT INTO orders (date, user_id) VALUES (?1, ?2)",
            params![date, user_id],
            "failed to create order",
        )?;
        debug!("created order {id} for user {user_id}");
        Ok(Order { id, date, user_id })
    }

    pub fn create_product(&self, name: &str, cost: f64) -> Result<Product> {
        let id = self.insert(
            "INSERT INTO products (name, cost) VALUES (?1, ?2)",
            params![name, cost],
            "failed to create product",
        )?;
        debug!("created product {id}");
        Ok(Product {
            id,
            name: name.to_string(),
            cost,
        })
    }

    /// Add one line item pairing `order_id` with `product_id`. Every call
    /// creates a new row, so attaching the same product twice yields two
    /// line items.
    pub fn attach_product(
        &self,
        order_id: i64,
        product_id: i64,
        item: LineItem,
    ) -> Result<OrderProduct> {
        let id = self.insert(
            "INSERT INTO order_products (order_id, product_id, packed) VALUES (?1, ?2, ?3)",
            params![order_id, product_id, item.packed],
            "failed to attach product",
        )?;
        debug!("attached product {product_id} to order {order_id} as line item {id}");
        Ok(OrderProduct {
            id,
            order_id,
            product_id,
            packed: item.packed,
        })
    }

    pub fn set_packed(&self, line_item_id: i64, packed: bool) -> Result<()> {
        let conn = self.db.connection()?;
        let updated = conn
            .execute(
                "UPDATE order_products SET packed = ?1 WHERE id = ?2",
                params![packed, line_item_id],
            )
            .map_err(|e| write_error("failed to update line item", e))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("line item {line_item_id}")));
        }
        Ok(())
    }

    pub fn detach_line_item(&self, line_item_id: i64) -> Result<()> {
        self.delete::<OrderProduct>(line_item_id)
    }

    /// Delete one row by id. Rows still referenced by a foreign key are
    /// refused with `ConstraintViolation`.
    pub fn delete<E: Entity>(&self, id: i64) -> Result<()> {
        let conn = self.db.connection()?;
        let deleted = conn
            .execute(
                &format!("DELETE FROM \"{}\" WHERE id = ?1", E::TABLE),
                params![id],
            )
            .map_err(|e| write_error(&format!("failed to delete from {}", E::TABLE), e))?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("{} row {id}", E::TABLE)));
        }
        Ok(())
    }

    pub fn find<E: Entity>(&self, id: i64) -> Result<E> {
        let conn = self.db.connection()?;
        let sql = format!("{} WHERE \"{}\".id = ?1", E::select_sql(), E::TABLE);
        conn.query_row(&sql, params![id], |row| E::from_row(row))
            .optional()
            .map_err(|e| Error::Database(format!("failed to load {} row {id}: {e}", E::TABLE)))?
            .ok_or_else(|| Error::NotFound(format!("{} row {id}", E::TABLE)))
    }

    /// Orders owned by `user_id`, ordered by id.
    pub fn orders_for_user(&self, user_id: i64) -> Result<Vec<Order>> {
        self.related(USER_ORDERS, user_id)
    }

    pub fn user_for_order(&self, order_id: i64) -> Result<User> {
        self.related(ORDER_USER, order_id)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("order {order_id}")))
    }

    /// Products on `order_id`, one entry per line item.
    pub fn products_for_order(&self, order_id: i64) -> Result<Vec<Product>> {
        self.related(ORDER_PRODUCTS, order_id)
    }

    /// Orders containing `product_id`, one entry per line item.
    pub fn orders_for_product(&self, product_id: i64) -> Result<Vec<Order>> {
        self.related(PRODUCT_ORDERS, product_id)
    }

    pub fn line_items_for_order(&self, order_id: i64) -> Result<Vec<OrderProduct>> {
        let sql = format!(
            "{} WHERE order_id = ?1 ORDER BY id",
            OrderProduct::select_sql()
        );
        self.query(&sql, order_id, "line items")
    }

    fn related<E: Entity>(&self, relation: Relation, id: i64) -> Result<Vec<E>> {
        if relation.target() != E::TABLE {
            return Err(Error::Other(format!(
                "relation {} maps {} rows to {} rows, not {}",
                relation.name(),
                relation.source(),
                relation.target(),
                E::TABLE
            )));
        }
        self.query(&relation.select_sql(E::COLUMNS), id, relation.name())
    }

    fn query<E: Entity>(&self, sql: &str, id: i64, what: &str) -> Result<Vec<E>> {
        let conn = self.db.connection()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params![id], |row| E::from_row(row))
            .map_err(|e| Error::Database(format!("failed to query {what}: {e}")))?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(
                row.map_err(|e| Error::Database(format!("failed to read {what} row: {e}")))?,
            );
        }
        Ok(entities)
    }

    fn insert(&self, sql: &str, params: &[&dyn ToSql], context: &str) -> Result<i64> {
        let conn = self.db.connection()?;
        conn.execute(sql, params).map_err(|e| write_error(context, e))?;
        Ok(conn.last_insert_rowid())
    }
}
