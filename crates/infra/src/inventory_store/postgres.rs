//! Postgres-backed inventory store.
//!
//! Each `PostgresInventoryTx` owns one pooled connection with an open
//! transaction. Stock rows are only written after being locked with
//! `SELECT … FOR UPDATE` in the same transaction; the connection goes back to
//! the pool when the transaction is committed, rolled back, or dropped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio_stream::StreamExt;
use tracing::instrument;

use pickline_core::{LocationId, PickingListId, PickingListItemId, ProductId, UserId};
use pickline_inventory::{
    Location, LocationPurpose, MovementType, NewPickingListItem, NewStockMovement,
    PackageComponent, PickingItemStatus, PickingListItem, Product, StockCandidate, StockMovement,
};

use super::r#trait::{
    InventoryStore, InventoryTx, LockMode, NewPickingList, ProductChanges, ProductMasterFilter,
    ProductMasterRow, RowStream, StockReportFilter, StockReportRow, StoreError,
    check_savepoint_name,
};
use crate::db::map_sqlx_error;

const STOCK_CANDIDATES_SQL: &str = r#"
    SELECT sl.location_id, l.code, l.floor, l.purpose, sl.quantity
    FROM stock_locations sl
    JOIN locations l ON l.id = sl.location_id
    WHERE sl.product_id = $1
      AND sl.quantity > 0
      AND l.purpose = 'DISPLAY'
    ORDER BY sl.location_id
"#;

const STOCK_CANDIDATES_FOR_UPDATE_SQL: &str = r#"
    SELECT sl.location_id, l.code, l.floor, l.purpose, sl.quantity
    FROM stock_locations sl
    JOIN locations l ON l.id = sl.location_id
    WHERE sl.product_id = $1
      AND sl.quantity > 0
      AND l.purpose = 'DISPLAY'
    ORDER BY sl.location_id
    FOR UPDATE OF sl
"#;

const STOCK_REPORT_SQL: &str = r#"
    SELECT p.sku, p.name, p.price_cents, l.code AS location_code, l.floor, l.purpose, sl.quantity
    FROM stock_locations sl
    JOIN products p ON p.id = sl.product_id
    JOIN locations l ON l.id = sl.location_id
    WHERE ($1::text IS NULL OR starts_with(p.sku, $1))
      AND ($2::int IS NULL OR l.floor = $2)
      AND ($3::text IS NULL OR l.purpose = $3)
      AND ($4::bool OR sl.quantity <> 0)
    ORDER BY p.sku ASC, l.code ASC
"#;

const PRODUCT_MASTER_SQL: &str = r#"
    SELECT
        p.sku,
        p.name,
        p.price_cents,
        p.is_active,
        p.is_package,
        COALESCE(
            string_agg(c.sku || ' x' || pc.quantity_per_package, '; ' ORDER BY pc.position, c.sku),
            ''
        ) AS components
    FROM products p
    LEFT JOIN package_components pc ON pc.package_product_id = p.id
    LEFT JOIN products c ON c.id = pc.component_product_id
    WHERE (NOT $1::bool OR p.is_active)
      AND ($2::text IS NULL OR starts_with(p.sku, $2))
    GROUP BY p.id, p.sku, p.name, p.price_cents, p.is_active, p.is_package
    ORDER BY p.sku ASC
"#;

/// Postgres inventory store (hands out transactions from a shared pool).
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl InventoryStore for PostgresInventoryStore {
    type Tx = PostgresInventoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresInventoryTx { tx })
    }
}

/// An open Postgres transaction over the inventory tables.
#[derive(Debug)]
pub struct PostgresInventoryTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl InventoryTx for PostgresInventoryTx {
    async fn product(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            "SELECT id, sku, name, price_cents, is_active, is_package FROM products WHERE id = $1",
        )
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("product", e))?;

        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self, skus), fields(sku_count = skus.len()), err)]
    async fn products_by_sku(&mut self, skus: &[String]) -> Result<HashMap<String, Product>, StoreError> {
        if skus.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, sku, name, price_cents, is_active, is_package
            FROM products
            WHERE sku = ANY($1)
            "#,
        )
        .bind(skus)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("products_by_sku", e))?;

        let mut products = HashMap::with_capacity(rows.len());
        for row in &rows {
            let product = product_from_row(row)?;
            products.insert(product.sku.clone(), product);
        }
        Ok(products)
    }

    async fn package_components(
        &mut self,
        package_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, Vec<PackageComponent>>, StoreError> {
        if package_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<i64> = package_ids.iter().map(|id| id.get()).collect();

        let rows = sqlx::query(
            r#"
            SELECT
                pc.package_product_id,
                pc.component_product_id,
                c.sku AS component_sku,
                c.is_package AS component_is_package,
                pc.quantity_per_package
            FROM package_components pc
            JOIN products c ON c.id = pc.component_product_id
            WHERE pc.package_product_id = ANY($1)
            ORDER BY pc.package_product_id, pc.position, pc.component_product_id
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("package_components", e))?;

        let mut components: HashMap<ProductId, Vec<PackageComponent>> = HashMap::new();
        for row in &rows {
            let component = PackageComponent {
                package_product_id: ProductId::new(get(row, "package_product_id")?),
                component_product_id: ProductId::new(get(row, "component_product_id")?),
                component_sku: get(row, "component_sku")?,
                component_is_package: get(row, "component_is_package")?,
                quantity_per_package: get(row, "quantity_per_package")?,
            };
            components
                .entry(component.package_product_id)
                .or_default()
                .push(component);
        }
        Ok(components)
    }

    async fn update_product(&mut self, id: ProductId, changes: &ProductChanges) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE products
            SET name = COALESCE($2, name),
                price_cents = COALESCE($3, price_cents),
                is_active = COALESCE($4, is_active)
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(changes.name.as_deref())
        .bind(changes.price_cents)
        .bind(changes.is_active)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("product {id}")));
        }
        Ok(())
    }

    async fn locations_by_code(&mut self, codes: &[String]) -> Result<HashMap<String, Location>, StoreError> {
        if codes.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query("SELECT id, code, floor, purpose FROM locations WHERE code = ANY($1)")
            .bind(codes)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("locations_by_code", e))?;

        let mut locations = HashMap::with_capacity(rows.len());
        for row in &rows {
            let location = Location {
                id: LocationId::new(get(row, "id")?),
                code: get(row, "code")?,
                floor: get(row, "floor")?,
                purpose: purpose_from_row(row, "purpose")?,
            };
            locations.insert(location.code.clone(), location);
        }
        Ok(locations)
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    async fn stock_candidates(
        &mut self,
        product_id: ProductId,
        lock: LockMode,
    ) -> Result<Vec<StockCandidate>, StoreError> {
        let sql = match lock {
            LockMode::Shared => STOCK_CANDIDATES_SQL,
            LockMode::ForUpdate => STOCK_CANDIDATES_FOR_UPDATE_SQL,
        };

        let rows = sqlx::query(sql)
            .bind(product_id.get())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("stock_candidates", e))?;

        rows.iter()
            .map(|row| {
                Ok(StockCandidate {
                    location_id: LocationId::new(get(row, "location_id")?),
                    location_code: get(row, "code")?,
                    floor: get(row, "floor")?,
                    purpose: purpose_from_row(row, "purpose")?,
                    quantity: get(row, "quantity")?,
                })
            })
            .collect()
    }

    async fn lock_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT quantity
            FROM stock_locations
            WHERE product_id = $1 AND location_id = $2
            FOR UPDATE
            "#,
        )
        .bind(product_id.get())
        .bind(location_id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stock", e))?;

        row.as_ref().map(|r| get(r, "quantity")).transpose()
    }

    async fn adjust_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE stock_locations
            SET quantity = quantity + $3, updated_at = NOW()
            WHERE product_id = $1 AND location_id = $2
            RETURNING quantity
            "#,
        )
        .bind(product_id.get())
        .bind(location_id.get())
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("adjust_stock", e))?;

        match row {
            Some(row) => get(&row, "quantity"),
            None => Err(StoreError::NotFound(format!(
                "stock row for product {product_id} at location {location_id}"
            ))),
        }
    }

    async fn set_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        quantity: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_locations (product_id, location_id, quantity)
            VALUES ($1, $2, $3)
            ON CONFLICT (product_id, location_id)
            DO UPDATE SET
                quantity = EXCLUDED.quantity,
                updated_at = NOW()
            "#,
        )
        .bind(product_id.get())
        .bind(location_id.get())
        .bind(quantity)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("set_stock", e))?;
        Ok(())
    }

    async fn record_movement(&mut self, movement: &NewStockMovement) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO stock_movements (
                product_id,
                quantity,
                from_location_id,
                to_location_id,
                movement_type,
                user_id,
                notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(movement.product_id.get())
        .bind(movement.quantity)
        .bind(movement.from_location_id.map(|l| l.get()))
        .bind(movement.to_location_id.map(|l| l.get()))
        .bind(movement.movement_type.as_str())
        .bind(movement.user_id.get())
        .bind(movement.notes.as_deref())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_movement", e))?;

        get(&row, "id")
    }

    async fn movements_for_product(&mut self, product_id: ProductId) -> Result<Vec<StockMovement>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, quantity, from_location_id, to_location_id,
                   movement_type, user_id, notes, created_at
            FROM stock_movements
            WHERE product_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(product_id.get())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("movements_for_product", e))?;

        rows.iter().map(movement_from_row).collect()
    }

    async fn picking_list_exists(&mut self, source: &str, invoice_no: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM picking_lists WHERE source = $1 AND invoice_no = $2) AS present",
        )
        .bind(source)
        .bind(invoice_no)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("picking_list_exists", e))?;

        get(&row, "present")
    }

    async fn create_picking_list(&mut self, list: &NewPickingList) -> Result<PickingListId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO picking_lists (source, invoice_no, created_by)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&list.source)
        .bind(&list.invoice_no)
        .bind(list.created_by.map(|u| u.get()))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("create_picking_list", e))?;

        Ok(PickingListId::new(get(&row, "id")?))
    }

    async fn insert_picking_item(
        &mut self,
        list_id: PickingListId,
        item: &NewPickingListItem,
    ) -> Result<PickingListItemId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO picking_list_items (
                picking_list_id,
                product_id,
                original_sku,
                quantity,
                status,
                suggested_location_id
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(list_id.get())
        .bind(item.product_id.get())
        .bind(&item.original_sku)
        .bind(item.quantity)
        .bind(PickingItemStatus::Pending.as_str())
        .bind(item.suggested_location_id.map(|l| l.get()))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_picking_item", e))?;

        Ok(PickingListItemId::new(get(&row, "id")?))
    }

    async fn picking_items(&mut self, ids: &[PickingListItemId]) -> Result<Vec<PickingListItem>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();

        let rows = sqlx::query(
            r#"
            SELECT id, picking_list_id, product_id, original_sku, quantity, status,
                   suggested_location_id, validated_by, validated_at
            FROM picking_list_items
            WHERE id = ANY($1)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&raw)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("picking_items", e))?;

        rows.iter()
            .map(|row| {
                let status: String = get(row, "status")?;
                Ok(PickingListItem {
                    id: PickingListItemId::new(get(row, "id")?),
                    picking_list_id: PickingListId::new(get(row, "picking_list_id")?),
                    product_id: ProductId::new(get(row, "product_id")?),
                    original_sku: get(row, "original_sku")?,
                    quantity: get(row, "quantity")?,
                    status: status
                        .parse()
                        .map_err(|e| StoreError::Decode(format!("picking item status: {e}")))?,
                    suggested_location_id: get::<Option<i64>>(row, "suggested_location_id")?
                        .map(LocationId::new),
                    validated_by: get::<Option<i64>>(row, "validated_by")?.map(UserId::new),
                    validated_at: get::<Option<DateTime<Utc>>>(row, "validated_at")?,
                })
            })
            .collect()
    }

    async fn set_suggested_location(
        &mut self,
        item_id: PickingListItemId,
        location_id: LocationId,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE picking_list_items SET suggested_location_id = $2 WHERE id = $1")
            .bind(item_id.get())
            .bind(location_id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("set_suggested_location", e))?;
        Ok(())
    }

    async fn mark_item_validated(&mut self, item_id: PickingListItemId, user_id: UserId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE picking_list_items
            SET status = $2, validated_by = $3, validated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(item_id.get())
        .bind(PickingItemStatus::Validated.as_str())
        .bind(user_id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_item_validated", e))?;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        check_savepoint_name(name)?;
        let sql = format!("SAVEPOINT {name}");
        sqlx::query(&sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("savepoint", e))?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        check_savepoint_name(name)?;
        let sql = format!("RELEASE SAVEPOINT {name}");
        sqlx::query(&sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("release_savepoint", e))?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        check_savepoint_name(name)?;
        let sql = format!("ROLLBACK TO SAVEPOINT {name}");
        sqlx::query(&sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("rollback_to_savepoint", e))?;
        Ok(())
    }

    fn stream_stock_report<'a>(&'a mut self, filter: &'a StockReportFilter) -> RowStream<'a, StockReportRow> {
        let rows = sqlx::query(STOCK_REPORT_SQL)
            .bind(filter.sku_prefix.as_deref())
            .bind(filter.floor)
            .bind(filter.purpose.map(|p| p.as_str()))
            .bind(filter.include_empty)
            .fetch(&mut *self.tx)
            .map(|row| {
                let row = row.map_err(|e| map_sqlx_error("stream_stock_report", e))?;
                Ok(StockReportRow {
                    sku: get(&row, "sku")?,
                    name: get(&row, "name")?,
                    price_cents: get(&row, "price_cents")?,
                    location_code: get(&row, "location_code")?,
                    floor: get(&row, "floor")?,
                    purpose: purpose_from_row(&row, "purpose")?,
                    quantity: get(&row, "quantity")?,
                })
            });
        Box::pin(rows)
    }

    fn stream_products<'a>(&'a mut self, filter: &'a ProductMasterFilter) -> RowStream<'a, ProductMasterRow> {
        let rows = sqlx::query(PRODUCT_MASTER_SQL)
            .bind(filter.active_only)
            .bind(filter.sku_prefix.as_deref())
            .fetch(&mut *self.tx)
            .map(|row| {
                let row = row.map_err(|e| map_sqlx_error("stream_products", e))?;
                Ok(ProductMasterRow {
                    sku: get(&row, "sku")?,
                    name: get(&row, "name")?,
                    price_cents: get(&row, "price_cents")?,
                    is_active: get(&row, "is_active")?,
                    is_package: get(&row, "is_package")?,
                    components: get(&row, "components")?,
                })
            });
        Box::pin(rows)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

// SQLx row helpers

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Decode(format!("column {column}: {e}")))
}

fn purpose_from_row(row: &PgRow, column: &str) -> Result<LocationPurpose, StoreError> {
    let raw: String = get(row, column)?;
    raw.parse()
        .map_err(|e| StoreError::Decode(format!("column {column}: {e}")))
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: ProductId::new(get(row, "id")?),
        sku: get(row, "sku")?,
        name: get(row, "name")?,
        price_cents: get(row, "price_cents")?,
        is_active: get(row, "is_active")?,
        is_package: get(row, "is_package")?,
    })
}

fn movement_from_row(row: &PgRow) -> Result<StockMovement, StoreError> {
    let movement_type: String = get(row, "movement_type")?;
    let movement_type: MovementType = movement_type
        .parse()
        .map_err(|e| StoreError::Decode(format!("movement type: {e}")))?;

    Ok(StockMovement {
        id: get(row, "id")?,
        movement: NewStockMovement {
            product_id: ProductId::new(get(row, "product_id")?),
            quantity: get(row, "quantity")?,
            from_location_id: get::<Option<i64>>(row, "from_location_id")?.map(LocationId::new),
            to_location_id: get::<Option<i64>>(row, "to_location_id")?.map(LocationId::new),
            movement_type,
            user_id: UserId::new(get(row, "user_id")?),
            notes: get(row, "notes")?,
        },
        created_at: get(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sku_prefix_filters_match_literally() {
        for sql in [STOCK_REPORT_SQL, PRODUCT_MASTER_SQL] {
            assert!(sql.contains("starts_with(p.sku, $"));
            assert!(!sql.contains("LIKE"), "wildcards in a SKU prefix must not match: {sql}");
        }
    }
}
