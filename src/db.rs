use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::ControlSettings;

/// Connect the control-plane pool and optionally create the schema.
/// `CONTROL_AUTO_CREATE_SCHEMA` is a test/local fallback; deployments run the
/// bundled migrations out of band.
pub async fn connect(settings: &ControlSettings) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await?;

    if settings.control_auto_create_schema {
        sqlx::migrate!().run(&pool).await?;
    }

    Ok(pool)
}
