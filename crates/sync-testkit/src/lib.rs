//! Fakes shared by every pipeline crate's test suite: an in-memory
//! [`DbDriver`](sync_db::DbDriver) and a recording
//! [`MonitorSink`](sync_monitor::MonitorSink), so unit tests never need a
//! live Postgres instance.

mod fake_driver;
mod fake_sink;

pub use fake_driver::FakeDriver;
pub use fake_sink::{FakeSink, Published, RecordedAlert};

use chrono::{DateTime, Utc};
use sync_types::InvoiceRow;

/// Build an `InvoiceRow` fixture with the six named columns; `extra` is
/// empty and can be set afterwards by the caller.
pub fn invoice(
    num_0: &str,
    dossier_0: &str,
    mntglb_0: f64,
    mntreg_0: f64,
    sync_date: Option<DateTime<Utc>>,
) -> InvoiceRow {
    InvoiceRow {
        num_0: num_0.to_string(),
        dossier_0: dossier_0.to_string(),
        mntglb_0,
        mntreg_0,
        sync_date,
        bpr_0: None,
        extra: serde_json::Map::new(),
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
