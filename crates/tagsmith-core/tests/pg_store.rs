//! Runs the record store against a live Postgres. Skipped unless
//! `DATABASE_URL` is set.

use sqlx::PgPool;
use tagsmith_core::{
    Identifier, IdentifierGenerator, MonoUlidGenerator, PgRecordStore, RecordFields, RecordStore,
    TableSelector,
};

async fn store() -> Option<PgRecordStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping integration test");
        return None;
    };
    let pool = PgPool::connect(&url).await.expect("pool");
    let store = PgRecordStore::new(pool);
    store.ensure_schema().await.expect("schema");
    Some(store)
}

fn fields(name: &str, identifier: Identifier) -> RecordFields {
    RecordFields {
        name: name.into(),
        public_url: format!("https://proj.supabase.co/object/public/b/static/{identifier}.jpg"),
        identifier,
        encoded_copy: Some("/9j/".into()),
    }
}

#[tokio::test]
async fn rows_round_trip_through_postgres() {
    let Some(store) = store().await else { return };
    let ids = MonoUlidGenerator::system();

    let product = ids.new_identifier("Widget").expect("id");
    store
        .insert(TableSelector::Product, &fields("Widget", product.clone()))
        .await
        .expect("insert product");
    let qr = ids.new_identifier("Lamp").expect("id");
    store
        .insert(TableSelector::QrCode, &fields("Lamp", qr.clone()))
        .await
        .expect("insert qr");

    let found = store.lookup(&product).await.expect("lookup").expect("row");
    assert_eq!(found.name, "Widget");
    assert_eq!(found.unique_id, product.as_str());
    assert_eq!(found.source, "products_new");

    let found = store.lookup(&qr).await.expect("lookup").expect("row");
    assert_eq!(found.source, "qr_codes_new");

    let missing = ids.new_identifier("none").expect("id");
    assert!(store.lookup(&missing).await.expect("lookup").is_none());

    let err = store
        .insert(TableSelector::Product, &fields("Widget", product))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{err}");
}
