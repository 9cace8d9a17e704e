//! Database instance module
use surrealdb::{Surreal, engine::any::Any};

use crate::config::{DatabaseAuthMethod, DatabaseConfig};

pub type Db = Surreal<Any>;

pub const TRANSFER_TABLE: &str = "transfer";
pub const CHUNK_TABLE: &str = "chunk";
pub const ARTIFACT_TABLE: &str = "artifact";

const SCHEMA: &str = "
    DEFINE TABLE IF NOT EXISTS transfer SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS transfer_status_domain ON transfer FIELDS status, domain;
    DEFINE TABLE IF NOT EXISTS chunk SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS chunk_transfer ON chunk FIELDS transfer;
    DEFINE TABLE IF NOT EXISTS artifact SCHEMALESS;
";

#[tracing::instrument(skip(config), fields(url = %config.database_url))]
pub async fn init_database(config: &DatabaseConfig) -> surrealdb::Result<Db> {
    tracing::info!("Connecting to database at {}", config.database_url);
    let db = surrealdb::engine::any::connect(config.database_url.as_str()).await?;

    match config.db_auth_method {
        DatabaseAuthMethod::Root => {
            tracing::info!("Signing in as root user");
            db.signin(surrealdb::opt::auth::Root {
                username: &config.root_username,
                password: &config.root_password,
            })
            .await?;
        }
        DatabaseAuthMethod::None => {
            tracing::info!("No authentication configured");
        }
    }

    tracing::info!(
        "Using namespace '{}' and database '{}'",
        config.db_namespace,
        config.db_database
    );
    db.use_ns(config.db_namespace.as_str())
        .use_db(config.db_database.as_str())
        .await?;

    define_schema(&db).await?;

    tracing::info!("Database initialization complete");
    Ok(db)
}

pub async fn define_schema(db: &Db) -> surrealdb::Result<()> {
    db.query(SCHEMA).await?.check()?;
    Ok(())
}

/// Fresh in-memory database, one per test.
#[cfg(test)]
pub async fn memory_db() -> Db {
    let db = surrealdb::engine::any::connect("mem://").await.unwrap();
    db.use_ns("test").use_db("test").await.unwrap();
    define_schema(&db).await.unwrap();
    db
}
