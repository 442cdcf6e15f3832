//! DB-backed test, skipped if SYNC_DATABASE_URL is not set.

use chrono::Utc;
use sync_db::{insert_rows, qualified_table, select_all, PgDriver};
use sync_types::InvoiceRow;

#[tokio::test]
async fn insert_then_select_round_trips() -> anyhow::Result<()> {
    let url = match std::env::var("SYNC_DATABASE_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: SYNC_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sync_db::connect(&url).await?;
    sync_db::provision_schema(&pool, "test_round_trip").await?;
    let table = qualified_table("test_round_trip");
    let driver = PgDriver::new(pool);

    let row = InvoiceRow {
        num_0: "A1".to_string(),
        dossier_0: "CAS".to_string(),
        mntglb_0: 100.0,
        mntreg_0: 30.0,
        sync_date: Some(Utc::now()),
        bpr_0: Some("BP1".to_string()),
        extra: serde_json::Map::new(),
    };

    insert_rows(&driver, &table, std::slice::from_ref(&row)).await?;

    let read_back = select_all(&driver, &table).await?;
    let found = read_back
        .rows()
        .iter()
        .find(|r| r.num_0 == "A1" && r.dossier_0 == "CAS")
        .expect("row must round-trip");
    assert_eq!(found.mntglb_0, 100.0);
    assert_eq!(found.mntreg_0, 30.0);
    assert_eq!(found.bpr_0.as_deref(), Some("BP1"));

    Ok(())
}
