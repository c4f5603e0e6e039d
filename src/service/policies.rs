use std::sync::Arc;

use chrono::DateTime;
use sqlx::AnyPool;
use tracing::{info, warn};

use super::{merge, validation, ServiceError};
use crate::db::{self, PolicyRecord, StoreError};
use crate::model::{Policy, PolicyList, PolicyType};
use crate::opa::OpaClient;
use crate::rego;

/// CRUD orchestration over the registry. Writes go to both stores (the
/// engine holds the Rego source, the database the metadata row) in an order
/// that keeps every committed row backed by a source: the engine write
/// precedes the row insert on create, and the old source is fetched before a
/// rego-changing update so the engine can be restored if the row write
/// fails. The cross-store reconciliation is best-effort, not transactional;
/// the only reachable partial state is an orphan engine source.
#[derive(Clone)]
pub struct PolicyService {
    pool: AnyPool,
    opa: Arc<OpaClient>,
}

impl PolicyService {
    pub fn new(pool: AnyPool, opa: Arc<OpaClient>) -> Self {
        Self { pool, opa }
    }

    pub async fn create_policy(
        &self,
        policy: Policy,
        client_id: Option<String>,
    ) -> Result<Policy, ServiceError> {
        validation::validate_create_input(&policy)?;
        let policy_id = validation::resolve_policy_id(client_id.as_deref())?;

        let rego_code = policy.rego_code.clone().unwrap_or_default();
        let package_name = rego::extract_package_name(&rego_code)
            .map_err(|err| ServiceError::invalid_argument("Invalid Rego code", err.to_string()))?;

        let mut record = record_from_api(&policy, &policy_id);
        record.package_name = package_name;

        self.opa
            .store_policy(&policy_id, &rego_code)
            .await
            .map_err(|err| ServiceError::from_engine(err, "create"))?;

        match db::create_policy(&self.pool, &record).await {
            Ok(created) => {
                info!(policy_id = %created.id, package_name = %created.package_name, "policy created");
                Ok(api_from_record(&created))
            }
            Err(err) => {
                if let Err(cleanup_err) = self.opa.delete_policy(&policy_id).await {
                    warn!(
                        policy_id = %policy_id,
                        error = %cleanup_err,
                        "failed to remove rego source after store error"
                    );
                }
                Err(ServiceError::from_store(err, &record, "create"))
            }
        }
    }

    /// Returns the row joined with the Rego source currently stored in the
    /// engine; a missing source while the row exists surfaces as internal.
    pub async fn get_policy(&self, id: &str) -> Result<Policy, ServiceError> {
        let record = db::get_policy(&self.pool, id).await.map_err(|err| match err {
            StoreError::NotFound => ServiceError::policy_not_found(id),
            other => ServiceError::internal(
                "Failed to get policy",
                other.to_string(),
                Some(Box::new(other)),
            ),
        })?;

        let rego_code = self
            .opa
            .get_policy(id)
            .await
            .map_err(|err| ServiceError::from_engine(err, "get"))?;

        let mut policy = api_from_record(&record);
        policy.rego_code = Some(rego_code);
        Ok(policy)
    }

    /// Metadata only: `rego_code` comes back empty; callers fetch each
    /// policy by id to read its source.
    pub async fn list_policies(
        &self,
        filter: Option<&str>,
        order_by: Option<&str>,
        page_token: Option<String>,
        max_page_size: Option<i64>,
    ) -> Result<PolicyList, ServiceError> {
        let parsed_filter = match filter {
            Some(filter) if !filter.trim().is_empty() => validation::parse_filter(filter)?,
            _ => Default::default(),
        };
        let order_by = validation::parse_order_by(order_by.unwrap_or_default())?;
        let page_size = validation::resolve_page_size(max_page_size)?;

        let page = db::list_policies(
            &self.pool,
            &db::PolicyListOptions {
                filter: parsed_filter,
                order_by,
                page_token,
                page_size,
            },
        )
        .await
        .map_err(|err| {
            ServiceError::internal(
                "Failed to list policies",
                err.to_string(),
                Some(Box::new(err)),
            )
        })?;

        Ok(PolicyList {
            policies: page.policies.iter().map(api_from_record).collect(),
            next_page_token: (!page.next_page_token.is_empty()).then_some(page.next_page_token),
        })
    }

    pub async fn update_policy(&self, id: &str, patch: Policy) -> Result<Policy, ServiceError> {
        validation::validate_patch_input(&patch)?;

        let existing_record = db::get_policy(&self.pool, id).await.map_err(|err| match err {
            StoreError::NotFound => ServiceError::policy_not_found(id),
            other => ServiceError::internal(
                "Failed to get existing policy",
                other.to_string(),
                Some(Box::new(other)),
            ),
        })?;
        let existing = api_from_record(&existing_record);
        validation::validate_patch_immutable_fields(&patch, &existing)?;

        let merged = merge::merge_patch_onto_policy(&patch, &existing);
        let mut record = record_from_api(&merged, id);
        record.package_name = existing_record.package_name.clone();
        record.create_time = existing_record.create_time;

        // A patched source is mirrored into the engine before the row write;
        // the previous source is kept so the engine can be rolled back.
        let mut rollback_rego = None;
        if let Some(new_rego) = patch.rego_code.as_deref() {
            record.package_name = rego::extract_package_name(new_rego).map_err(|err| {
                ServiceError::invalid_argument("Invalid Rego code", err.to_string())
            })?;
            let old_rego = self
                .opa
                .get_policy(id)
                .await
                .map_err(|err| ServiceError::from_engine(err, "update"))?;
            self.opa
                .store_policy(id, new_rego)
                .await
                .map_err(|err| ServiceError::from_engine(err, "update"))?;
            rollback_rego = Some(old_rego);
        }

        match db::update_policy(&self.pool, &record).await {
            Ok(updated) => {
                info!(policy_id = %id, "policy updated");
                Ok(api_from_record(&updated))
            }
            Err(err) => {
                if let Some(old_rego) = rollback_rego {
                    if let Err(restore_err) = self.opa.store_policy(id, &old_rego).await {
                        warn!(
                            policy_id = %id,
                            error = %restore_err,
                            "failed to restore previous rego source after store error"
                        );
                    }
                }
                Err(ServiceError::from_store(err, &record, "update"))
            }
        }
    }

    /// Deletes the row, then the engine source best-effort: a leftover
    /// source without a row is within the registry's tolerated states, so an
    /// engine failure here does not fail the call.
    pub async fn delete_policy(&self, id: &str) -> Result<(), ServiceError> {
        db::delete_policy(&self.pool, id).await.map_err(|err| match err {
            StoreError::NotFound => ServiceError::policy_not_found(id),
            other => ServiceError::internal(
                "Failed to delete policy",
                other.to_string(),
                Some(Box::new(other)),
            ),
        })?;

        if let Err(err) = self.opa.delete_policy(id).await {
            warn!(policy_id = %id, error = %err, "failed to delete rego source from engine");
        }

        info!(policy_id = %id, "policy deleted");
        Ok(())
    }
}

/// Builds the persisted form of an API policy, applying the create defaults.
/// `package_name` and the timestamps are owned by the caller and the store.
fn record_from_api(policy: &Policy, id: &str) -> PolicyRecord {
    PolicyRecord {
        id: id.to_string(),
        display_name: policy.display_name.clone().unwrap_or_default(),
        description: policy.description.clone().unwrap_or_default(),
        policy_type: policy
            .policy_type
            .map(|policy_type| policy_type.as_str().to_string())
            .unwrap_or_default(),
        label_selector: policy.label_selector.clone().unwrap_or_default(),
        priority: policy.priority.unwrap_or(validation::DEFAULT_PRIORITY),
        package_name: String::new(),
        enabled: policy.enabled.unwrap_or(true),
        create_time: DateTime::UNIX_EPOCH,
        update_time: DateTime::UNIX_EPOCH,
    }
}

/// API form of a stored row: `path` derived, `rego_code` empty (the engine
/// owns sources), empty description/selector omitted.
fn api_from_record(record: &PolicyRecord) -> Policy {
    Policy {
        id: Some(record.id.clone()),
        path: Some(format!("policies/{}", record.id)),
        display_name: Some(record.display_name.clone()),
        description: (!record.description.is_empty()).then(|| record.description.clone()),
        policy_type: record.policy_type.parse::<PolicyType>().ok(),
        priority: Some(record.priority),
        label_selector: (!record.label_selector.is_empty())
            .then(|| record.label_selector.clone()),
        rego_code: Some(String::new()),
        enabled: Some(record.enabled),
        create_time: Some(record.create_time),
        update_time: Some(record.update_time),
    }
}
