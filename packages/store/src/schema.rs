//! Store schema definitions using SurrealQL.

use crate::connection::get_db;
use crate::error::StoreError;

/// Initialize the store schema.
///
/// Creates the job table and the indexes the claim and dependency queries
/// rely on.
pub async fn init_schema() -> Result<(), StoreError> {
    let db = get_db()?;

    tracing::info!("Initializing job store schema...");

    db.query(JOB_SCHEMA).await?;

    tracing::info!("Job store schema initialized");

    Ok(())
}

/// Job table schema.
///
/// The table is schemaless: payloads are opaque caller data and the lease,
/// result, and log shapes are owned by the record mapping in this crate.
/// The indexes serve the claim scan (state, priority, created_at), the
/// dependency scans, and lease-expiry reclamation.
const JOB_SCHEMA: &str = r#"
-- Job table for all queued, running, and finished jobs
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE FIELD IF NOT EXISTS state ON job TYPE string DEFAULT "ready";
DEFINE FIELD IF NOT EXISTS priority ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS attempts ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS retries_remaining ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS depends_on ON job TYPE array<string> DEFAULT [];
DEFINE FIELD IF NOT EXISTS log ON job TYPE array DEFAULT [];
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE datetime DEFAULT time::now();
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE datetime DEFAULT time::now();

-- Unique identity independent of the engine-assigned record id
DEFINE INDEX IF NOT EXISTS job_ident ON job FIELDS job_id UNIQUE;

-- Claim scan: ready jobs by priority then age
DEFINE INDEX IF NOT EXISTS job_claim ON job FIELDS state, priority, created_at;

-- Dependency scans
DEFINE INDEX IF NOT EXISTS job_state ON job FIELDS state;
DEFINE INDEX IF NOT EXISTS job_deps ON job FIELDS depends_on;

-- Lease-expiry reclamation
DEFINE INDEX IF NOT EXISTS job_lease_expiry ON job FIELDS lease.expires_at;
"#;
