use std::io::Write;

use tokio_stream::StreamExt;
use tracing::{debug, instrument};

use crate::inventory_store::{InventoryTx, ProductMasterFilter};

use super::throttle::ThrottleConfig;
use super::{ExportError, ExportStats, format_cents};

const HEADER: [&str; 6] = ["sku", "name", "price", "active", "package", "components"];

/// Stream the product catalog to a single CSV sink.
#[instrument(skip(tx, filter, out, throttle), err)]
pub async fn stream_product_master<T, W>(
    tx: &mut T,
    filter: &ProductMasterFilter,
    out: W,
    throttle: ThrottleConfig,
) -> Result<ExportStats, ExportError>
where
    T: InventoryTx,
    W: Write,
{
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(HEADER)?;

    let mut throttle = throttle.start();
    let mut rows = 0u64;

    let mut stream = tx.stream_products(filter);
    while let Some(row) = stream.next().await {
        let row = row?;
        writer.write_record([
            row.sku,
            row.name,
            format_cents(row.price_cents.into()),
            yes_no(row.is_active).to_string(),
            yes_no(row.is_package).to_string(),
            row.components,
        ])?;
        rows += 1;
        throttle.tick().await;
    }
    writer.flush()?;

    debug!(rows, "product master streamed");
    Ok(ExportStats {
        rows,
        distinct_skus: usize::try_from(rows).unwrap_or(usize::MAX),
        pauses: throttle.pauses(),
    })
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory_store::{InMemoryInventoryStore, InventoryStore};

    #[tokio::test]
    async fn packages_list_their_components() {
        let store = InMemoryInventoryStore::new();
        let c = store.add_product("C", "Component", 199);
        let d = store.add_product("D", "Dowel", 5);
        store.add_package("KIT", "Kit", 1000, &[(c, 3), (d, 8)]);

        let mut out = Vec::new();
        let mut tx = store.begin().await.unwrap();
        let stats = stream_product_master(
            &mut tx,
            &ProductMasterFilter::default(),
            &mut out,
            ThrottleConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(stats.rows, 3);
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "sku,name,price,active,package,components");
        assert_eq!(lines[1], "C,Component,1.99,yes,no,");
        assert_eq!(lines[3], "KIT,Kit,10.00,yes,yes,C x3; D x8");
    }

    #[tokio::test]
    async fn prefix_filter_applies() {
        let store = InMemoryInventoryStore::new();
        store.add_product("AB-1", "One", 100);
        store.add_product("CD-1", "Two", 100);

        let filter = ProductMasterFilter {
            sku_prefix: Some("AB".to_string()),
            ..Default::default()
        };
        let mut out = Vec::new();
        let mut tx = store.begin().await.unwrap();
        let stats = stream_product_master(&mut tx, &filter, &mut out, ThrottleConfig::default())
            .await
            .unwrap();
        assert_eq!(stats.rows, 1);
    }
}
