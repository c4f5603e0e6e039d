use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("policy not found")]
    NotFound,
    #[error("policy id already taken")]
    IdTaken,
    #[error("display_name and policy_type combination already taken")]
    DisplayNamePolicyTypeTaken,
    #[error("priority and policy_type combination already taken")]
    PriorityPolicyTypeTaken,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Persisted form of a policy. `rego_code` never lands here; the engine is
/// the authoritative store for sources and `package_name` is the cached
/// dispatch address derived from them.
#[derive(Debug, Clone)]
pub struct PolicyRecord {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub policy_type: String,
    pub label_selector: BTreeMap<String, String>,
    pub priority: i64,
    pub package_name: String,
    pub enabled: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// nil fields are ignored (not filtered).
#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    pub policy_type: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyListOptions {
    pub filter: PolicyFilter,
    /// Validated upstream; applied verbatim when present.
    pub order_by: Option<String>,
    pub page_token: Option<String>,
    pub page_size: i64,
}

#[derive(Debug, Clone)]
pub struct PolicyPage {
    pub policies: Vec<PolicyRecord>,
    pub next_page_token: String,
}

const POLICY_COLUMNS: &str = "id, display_name, description, policy_type, label_selector, \
     priority, package_name, enabled, create_time, update_time";

// The tie-break on id keeps the evaluation order total across runs.
const DEFAULT_ORDER: &str = "policy_type ASC, priority ASC, id ASC";

const DEFAULT_PAGE_SIZE: i64 = 50;

/// Current time truncated to the stored microsecond precision, so the
/// timestamps a write reports match what later reads return.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

pub async fn create_policy(
    pool: &AnyPool,
    policy: &PolicyRecord,
) -> Result<PolicyRecord, StoreError> {
    let mut policy = policy.clone();
    let now = now_micros();
    policy.create_time = now;
    policy.update_time = now;

    let labels_json =
        serde_json::to_string(&policy.label_selector).unwrap_or_else(|_| "{}".to_string());

    let result = sqlx::query(
        r#"
        INSERT INTO policies (
            id,
            display_name,
            description,
            policy_type,
            label_selector,
            priority,
            package_name,
            enabled,
            create_time,
            update_time
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&policy.id)
    .bind(&policy.display_name)
    .bind(&policy.description)
    .bind(&policy.policy_type)
    .bind(labels_json)
    .bind(policy.priority)
    .bind(&policy.package_name)
    .bind(i64::from(policy.enabled))
    .bind(policy.create_time.timestamp_micros())
    .bind(policy.update_time.timestamp_micros())
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(policy),
        Err(err) => Err(map_unique_violation(pool, err, &policy, false).await),
    }
}

pub async fn get_policy(pool: &AnyPool, id: &str) -> Result<PolicyRecord, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {POLICY_COLUMNS} FROM policies WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(row_to_policy(&row)?),
        None => Err(StoreError::NotFound),
    }
}

pub async fn list_policies(
    pool: &AnyPool,
    opts: &PolicyListOptions,
) -> Result<PolicyPage, StoreError> {
    let page_size = if opts.page_size > 0 {
        opts.page_size
    } else {
        DEFAULT_PAGE_SIZE
    };
    let offset = decode_page_token(opts.page_token.as_deref());

    let mut sql = format!("SELECT {POLICY_COLUMNS} FROM policies");
    let mut clauses = Vec::new();
    let mut next_param = 1;
    if opts.filter.policy_type.is_some() {
        clauses.push(format!("policy_type = ${next_param}"));
        next_param += 1;
    }
    if opts.filter.enabled.is_some() {
        clauses.push(format!("enabled = ${next_param}"));
        next_param += 1;
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    let order = opts
        .order_by
        .as_deref()
        .filter(|order| !order.is_empty())
        .unwrap_or(DEFAULT_ORDER);
    sql.push_str(&format!(
        " ORDER BY {order} LIMIT ${next_param} OFFSET ${}",
        next_param + 1
    ));

    let mut query = sqlx::query(&sql);
    if let Some(policy_type) = &opts.filter.policy_type {
        query = query.bind(policy_type);
    }
    if let Some(enabled) = opts.filter.enabled {
        query = query.bind(i64::from(enabled));
    }
    // Fetch one row past the page to know whether a next page exists.
    query = query.bind(page_size + 1).bind(offset);

    let rows = query.fetch_all(pool).await?;
    let mut policies = rows
        .iter()
        .map(row_to_policy)
        .collect::<Result<Vec<_>, _>>()?;

    let mut next_page_token = String::new();
    if policies.len() as i64 > page_size {
        policies.truncate(page_size as usize);
        next_page_token = encode_page_token(offset + page_size);
    }

    Ok(PolicyPage {
        policies,
        next_page_token,
    })
}

/// Writes the mutable columns only; id, policy_type and create_time are
/// never touched by an update.
pub async fn update_policy(
    pool: &AnyPool,
    policy: &PolicyRecord,
) -> Result<PolicyRecord, StoreError> {
    let mut policy = policy.clone();
    policy.update_time = now_micros();

    let labels_json =
        serde_json::to_string(&policy.label_selector).unwrap_or_else(|_| "{}".to_string());

    let result = sqlx::query(
        r#"
        UPDATE policies
        SET display_name = $1,
            description = $2,
            label_selector = $3,
            priority = $4,
            package_name = $5,
            enabled = $6,
            update_time = $7
        WHERE id = $8
        "#,
    )
    .bind(&policy.display_name)
    .bind(&policy.description)
    .bind(labels_json)
    .bind(policy.priority)
    .bind(&policy.package_name)
    .bind(i64::from(policy.enabled))
    .bind(policy.update_time.timestamp_micros())
    .bind(&policy.id)
    .execute(pool)
    .await;

    match result {
        Ok(done) if done.rows_affected() == 0 => Err(StoreError::NotFound),
        Ok(_) => Ok(policy),
        Err(err) => Err(map_unique_violation(pool, err, &policy, true).await),
    }
}

pub async fn delete_policy(pool: &AnyPool, id: &str) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM policies WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

/// The driver only reports that *some* unique constraint fired, so probe the
/// three uniqueness predicates with fresh reads, in the contract's fixed
/// order, and return the first sentinel whose predicate matches. Updates
/// exclude the row being updated. When no probe hits (or a probe itself
/// fails), the raw error is returned.
async fn map_unique_violation(
    pool: &AnyPool,
    err: sqlx::Error,
    attempted: &PolicyRecord,
    exclude_self: bool,
) -> StoreError {
    let is_unique_violation = match &err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation()
                || db_err.message().to_uppercase().contains("UNIQUE")
                || db_err.message().contains("duplicate key")
        }
        _ => false,
    };
    if !is_unique_violation {
        return StoreError::Database(err);
    }

    let id_probe = if exclude_self {
        sqlx::query("SELECT id FROM policies WHERE id = $1 AND id <> $2")
            .bind(&attempted.id)
            .bind(&attempted.id)
    } else {
        sqlx::query("SELECT id FROM policies WHERE id = $1").bind(&attempted.id)
    };
    match id_probe.fetch_optional(pool).await {
        Ok(Some(_)) => return StoreError::IdTaken,
        Ok(None) => {}
        Err(_) => return StoreError::Database(err),
    }

    let display_name_probe = if exclude_self {
        sqlx::query(
            "SELECT id FROM policies WHERE display_name = $1 AND policy_type = $2 AND id <> $3",
        )
        .bind(&attempted.display_name)
        .bind(&attempted.policy_type)
        .bind(&attempted.id)
    } else {
        sqlx::query("SELECT id FROM policies WHERE display_name = $1 AND policy_type = $2")
            .bind(&attempted.display_name)
            .bind(&attempted.policy_type)
    };
    match display_name_probe.fetch_optional(pool).await {
        Ok(Some(_)) => return StoreError::DisplayNamePolicyTypeTaken,
        Ok(None) => {}
        Err(_) => return StoreError::Database(err),
    }

    let priority_probe = if exclude_self {
        sqlx::query(
            "SELECT id FROM policies WHERE priority = $1 AND policy_type = $2 AND id <> $3",
        )
        .bind(attempted.priority)
        .bind(&attempted.policy_type)
        .bind(&attempted.id)
    } else {
        sqlx::query("SELECT id FROM policies WHERE priority = $1 AND policy_type = $2")
            .bind(attempted.priority)
            .bind(&attempted.policy_type)
    };
    match priority_probe.fetch_optional(pool).await {
        Ok(Some(_)) => return StoreError::PriorityPolicyTypeTaken,
        Ok(None) => {}
        Err(_) => return StoreError::Database(err),
    }

    StoreError::Database(err)
}

fn row_to_policy(row: &AnyRow) -> Result<PolicyRecord, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let display_name: String = row.try_get("display_name")?;
    let description: String = row.try_get("description")?;
    let policy_type: String = row.try_get("policy_type")?;
    let labels_json: String = row.try_get("label_selector")?;
    let priority: i64 = row.try_get("priority")?;
    let package_name: String = row.try_get("package_name")?;
    let enabled: i64 = row.try_get("enabled")?;
    let create_time: i64 = row.try_get("create_time")?;
    let update_time: i64 = row.try_get("update_time")?;

    let label_selector = serde_json::from_str(&labels_json).unwrap_or_default();

    Ok(PolicyRecord {
        id,
        display_name,
        description,
        policy_type,
        label_selector,
        priority,
        package_name,
        enabled: enabled != 0,
        create_time: DateTime::from_timestamp_micros(create_time).unwrap_or(DateTime::UNIX_EPOCH),
        update_time: DateTime::from_timestamp_micros(update_time).unwrap_or(DateTime::UNIX_EPOCH),
    })
}

fn encode_page_token(offset: i64) -> String {
    BASE64.encode(offset.to_string())
}

/// Tokens that fail to decode are treated as the first page.
fn decode_page_token(token: Option<&str>) -> i64 {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return 0;
    };
    BASE64
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|text| text.parse::<i64>().ok())
        .unwrap_or(0)
}
