//! Typed rows of the order catalog.

use chrono::NaiveDate;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// A table-backed record. `COLUMNS` lists the columns `from_row` reads, in
/// order, starting with the primary key.
pub trait Entity: Sized {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// `SELECT` of every column, qualified by table name so the statement can
    /// be extended with joins.
    fn select_sql() -> String {
        let columns: Vec<String> = Self::COLUMNS
            .iter()
            .map(|c| format!("\"{}\".\"{c}\"", Self::TABLE))
            .collect();
        format!("SELECT {} FROM \"{}\"", columns.join(", "), Self::TABLE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

impl Entity for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [&'static str] = &["id", "name"];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub date: NaiveDate,
    pub user_id: i64,
}

impl Entity for Order {
    const TABLE: &'static str = "orders";
    const COLUMNS: &'static [&'static str] = &["id", "date", "user_id"];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            date: row.get(1)?,
            user_id: row.get(2)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub cost: f64,
}

impl Entity for Product {
    const TABLE: &'static str = "products";
    const COLUMNS: &'static [&'static str] = &["id", "name", "cost"];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            cost: row.get(2)?,
        })
    }
}

/// One line item: a single pairing of an order with a product. The same
/// pair may appear on several rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderProduct {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub packed: bool,
}

impl Entity for OrderProduct {
    const TABLE: &'static str = "order_products";
    const COLUMNS: &'static [&'static str] = &["id", "order_id", "product_id", "packed"];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            order_id: row.get(1)?,
            product_id: row.get(2)?,
            packed: row.get(3)?,
        })
    }
}

/// Attributes scoped to a single order/product pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub packed: bool,
}

impl LineItem {
    pub fn packed() -> Self {
        Self { packed: true }
    }
}
