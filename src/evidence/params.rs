// ================================================================================================
// Parameter Versioning
// ================================================================================================
//
// Content-hashed, approvable, rollbackable parameter sets. History is append-only:
// rollback writes a new row pointing at the restored version; past rows keep their
// contents forever and only advance their lifecycle status.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString, IntoStaticStr};
use tracing::info;

use crate::{
    error::{EvidenceError, WorldlineResult},
    evidence::canonical,
    types::{ProjectId, TenantId, VersionId},
};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParameterStatus {
    Proposed,
    Active,
    RolledBack,
}

/// A versioned parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVersion {
    pub id: VersionId,
    pub project_id: ProjectId,
    pub tenant_id: TenantId,
    pub version_number: u32,
    /// SHA-256 over the canonical parameter document.
    pub version_hash: String,
    pub parameters: Value,
    pub status: ParameterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_id: Option<VersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_to_id: Option<VersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_description: Option<String>,
    pub auto_tuned: bool,
    pub created_at: DateTime<Utc>,
}

/// In-process parameter version store.
#[derive(Default)]
pub struct ParameterStore {
    versions: DashMap<VersionId, ParameterVersion>,
    by_project: DashMap<ProjectId, Vec<VersionId>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose a new parameter set. The auto-tuner sets `auto_tuned`; the rotation
    /// policy decides `requires_approval`.
    pub fn propose(
        &self,
        project_id: ProjectId,
        tenant_id: TenantId,
        parameters: Value,
        change_description: Option<String>,
        auto_tuned: bool,
        requires_approval: bool,
    ) -> ParameterVersion {
        let version_number = self
            .history(project_id)
            .last()
            .map(|v| v.version_number + 1)
            .unwrap_or(1);
        let version = ParameterVersion {
            id: VersionId::new(),
            project_id,
            tenant_id,
            version_number,
            version_hash: canonical::sha256_hex(&parameters),
            parameters,
            status: ParameterStatus::Proposed,
            previous_version_id: self.active_version(project_id).map(|v| v.id),
            rolled_back_to_id: None,
            rollback_reason: None,
            requires_approval,
            approved_by: None,
            approved_at: None,
            change_description,
            auto_tuned,
            created_at: Utc::now(),
        };
        self.versions.insert(version.id, version.clone());
        self.by_project
            .entry(project_id)
            .or_default()
            .push(version.id);
        info!(version = version_number, project = %project_id, "parameter version proposed");
        version
    }

    pub fn get(&self, id: VersionId) -> Option<ParameterVersion> {
        self.versions.get(&id).map(|entry| entry.clone())
    }

    /// Versions for a project in version-number order.
    pub fn history(&self, project_id: ProjectId) -> Vec<ParameterVersion> {
        let mut versions: Vec<ParameterVersion> = self
            .by_project
            .get(&project_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(*id)).collect())
            .unwrap_or_default();
        versions.sort_by_key(|v| v.version_number);
        versions
    }

    pub fn active_version(&self, project_id: ProjectId) -> Option<ParameterVersion> {
        self.history(project_id)
            .into_iter()
            .find(|v| v.status == ParameterStatus::Active)
    }

    pub fn approve(&self, id: VersionId, approver: &str) -> WorldlineResult<ParameterVersion> {
        let mut version = self
            .versions
            .get_mut(&id)
            .ok_or_else(|| EvidenceError::UnknownVersion(id.to_string()))?;
        version.approved_by = Some(approver.to_string());
        version.approved_at = Some(Utc::now());
        Ok(version.clone())
    }

    /// Activate a proposed version. Approval is required unless the version opted out.
    /// Any previously active version is retired.
    pub fn activate(&self, id: VersionId) -> WorldlineResult<ParameterVersion> {
        let (project_id, requires_approval, approved) = {
            let version = self
                .versions
                .get(&id)
                .ok_or_else(|| EvidenceError::UnknownVersion(id.to_string()))?;
            (
                version.project_id,
                version.requires_approval,
                version.approved_by.is_some(),
            )
        };
        if requires_approval && !approved {
            return Err(EvidenceError::NotApproved(id.to_string()).into());
        }

        if let Some(active) = self.active_version(project_id) {
            if active.id != id {
                if let Some(mut entry) = self.versions.get_mut(&active.id) {
                    entry.status = ParameterStatus::RolledBack;
                }
            }
        }

        let mut version = self
            .versions
            .get_mut(&id)
            .ok_or_else(|| EvidenceError::UnknownVersion(id.to_string()))?;
        version.status = ParameterStatus::Active;
        info!(version = version.version_number, "parameter version activated");
        Ok(version.clone())
    }

    /// Roll back to a prior version by writing a new row that restores its parameters
    /// and points at it via `rolled_back_to_id`. The restored content activates
    /// immediately; history is preserved.
    pub fn rollback(
        &self,
        project_id: ProjectId,
        to_version: VersionId,
        reason: Option<String>,
    ) -> WorldlineResult<ParameterVersion> {
        let target = self
            .get(to_version)
            .ok_or_else(|| EvidenceError::UnknownVersion(to_version.to_string()))?;

        let previous_active = self.active_version(project_id);
        if let Some(active) = &previous_active {
            if let Some(mut entry) = self.versions.get_mut(&active.id) {
                entry.status = ParameterStatus::RolledBack;
            }
        }

        let version_number = self
            .history(project_id)
            .last()
            .map(|v| v.version_number + 1)
            .unwrap_or(1);
        let restored = ParameterVersion {
            id: VersionId::new(),
            project_id,
            tenant_id: target.tenant_id,
            version_number,
            version_hash: target.version_hash.clone(),
            parameters: target.parameters.clone(),
            status: ParameterStatus::Active,
            previous_version_id: previous_active.map(|v| v.id),
            rolled_back_to_id: Some(target.id),
            rollback_reason: reason,
            requires_approval: false,
            approved_by: None,
            approved_at: None,
            change_description: Some(format!(
                "rollback to version {}",
                target.version_number
            )),
            auto_tuned: false,
            created_at: Utc::now(),
        };
        self.versions.insert(restored.id, restored.clone());
        self.by_project
            .entry(project_id)
            .or_default()
            .push(restored.id);
        info!(
            restored = restored.version_number,
            target = target.version_number,
            "parameter rollback recorded"
        );
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store_with_project() -> (ParameterStore, ProjectId, TenantId) {
        (ParameterStore::new(), ProjectId::new(), TenantId::new())
    }

    #[test]
    fn version_numbers_are_monotonic_per_project() {
        let (store, project, tenant) = store_with_project();
        let v1 = store.propose(project, tenant, json!({"t": 0.7}), None, false, true);
        let v2 = store.propose(project, tenant, json!({"t": 0.8}), None, false, true);
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);
        assert_eq!(store.history(project).len(), 2);
    }

    #[test]
    fn identical_parameters_share_a_content_hash() {
        let (store, project, tenant) = store_with_project();
        let v1 = store.propose(project, tenant, json!({"b": 2, "a": 1}), None, false, false);
        let v2 = store.propose(project, tenant, json!({"a": 1, "b": 2}), None, false, false);
        assert_eq!(v1.version_hash, v2.version_hash);
    }

    #[test]
    fn activation_requires_approval_unless_opted_out() {
        let (store, project, tenant) = store_with_project();
        let gated = store.propose(project, tenant, json!({"x": 1}), None, false, true);
        assert!(store.activate(gated.id).is_err());

        store.approve(gated.id, "reviewer").unwrap();
        let active = store.activate(gated.id).unwrap();
        assert_eq!(active.status, ParameterStatus::Active);

        let ungated = store.propose(project, tenant, json!({"x": 2}), None, true, false);
        let active = store.activate(ungated.id).unwrap();
        assert_eq!(active.status, ParameterStatus::Active);
        // Exactly one active version per project.
        assert_eq!(store.active_version(project).unwrap().id, ungated.id);
    }

    #[test]
    fn rollback_appends_a_new_row_and_preserves_history() {
        let (store, project, tenant) = store_with_project();
        let v1 = store.propose(project, tenant, json!({"x": 1}), None, false, false);
        store.activate(v1.id).unwrap();
        let v2 = store.propose(project, tenant, json!({"x": 2}), None, false, false);
        store.activate(v2.id).unwrap();

        let restored = store.rollback(project, v1.id, Some("regression".into())).unwrap();
        assert_eq!(restored.version_number, 3);
        assert_eq!(restored.rolled_back_to_id, Some(v1.id));
        assert_eq!(restored.version_hash, v1.version_hash);
        assert_eq!(restored.status, ParameterStatus::Active);

        // Past rows survive with their parameters intact.
        let history = store.history(project);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].parameters, json!({"x": 1}));
        assert_eq!(history[1].parameters, json!({"x": 2}));
        assert_eq!(history[1].status, ParameterStatus::RolledBack);
    }
}
