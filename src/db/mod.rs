use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;

mod policies;

pub use policies::{
    create_policy, delete_policy, get_policy, list_policies, update_policy, PolicyFilter,
    PolicyListOptions, PolicyPage, PolicyRecord, StoreError,
};

pub async fn connect(database_url: &str) -> Result<AnyPool, sqlx::Error> {
    install_default_drivers();
    AnyPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await
}

/// Creates the policy table and its composite unique indexes. The column
/// types are the portable subset understood by both supported backends;
/// timestamps are unix microseconds, booleans 0/1.
pub async fn init(pool: &AnyPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policies (
            id VARCHAR(63) NOT NULL PRIMARY KEY,
            display_name TEXT NOT NULL,
            description TEXT NOT NULL,
            policy_type TEXT NOT NULL,
            label_selector TEXT NOT NULL,
            priority BIGINT NOT NULL,
            package_name TEXT NOT NULL,
            enabled BIGINT NOT NULL,
            create_time BIGINT NOT NULL,
            update_time BIGINT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_policies_display_name_policy_type
        ON policies (display_name, policy_type);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_policies_priority_policy_type
        ON policies (priority, policy_type);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
