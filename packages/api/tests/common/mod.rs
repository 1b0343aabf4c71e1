use std::sync::LazyLock;

use quarry_store::{StoreConfig, StoreError};
use tokio::sync::{Mutex, MutexGuard};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Dedicated, long-lived runtime that owns the global store connection.
///
/// The store keeps a single process-global SurrealDB connection whose
/// background router task lives on whatever runtime first spawned it. Each
/// `#[tokio::test]` builds and then drops its own runtime, so if the
/// connection were initialized on a test's runtime the router would die when
/// that test ended, leaving every later test talking to a closed channel.
/// Initializing it on this never-dropped runtime keeps the router alive for
/// the whole test binary; client calls from the per-test runtimes just send
/// messages to it over the (runtime-agnostic) channel.
static STORE_RT: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build store runtime")
});

/// Serialize tests against the shared in-memory store and start each one
/// from an empty job table.
pub async fn setup() -> Result<MutexGuard<'static, ()>, StoreError> {
    let guard = TEST_LOCK.lock().await;
    STORE_RT
        .spawn(async { quarry_store::init(StoreConfig::memory()).await })
        .await
        .expect("init store on dedicated runtime")?;
    let db = quarry_store::get_db()?;
    db.query("DELETE job;").await?;
    Ok(guard)
}
