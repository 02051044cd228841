pub mod jobs;
pub mod metrics;
pub mod output;
pub mod stats;
pub mod worker;

use anyhow::Result;
use dragnet_db::Store;

/// Open the store at the configured location.
pub async fn open_store() -> Result<Store> {
    Store::open(&dragnet_protocol::config::database_url()).await
}
