//! Maps an inbound API key and project label to ledger identities.

use axum::http::{header, HeaderMap};

use super::ProxyError;
use crate::store::{ModelId, ProjectId, SqliteStore, User};

/// Header carrying the caller's project label.
pub const PROJECT_HEADER: &str = "x-project";

/// Project assigned to calls without a project label.
pub const DEFAULT_PROJECT: &str = "<default>";

/// Who a call is billed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Authenticated user
    pub user: User,
    /// Project label (or [`DEFAULT_PROJECT`])
    pub project: String,
    /// Project row
    pub project_id: ProjectId,
}

/// Attribution resolver.
///
/// Users are only ever looked up; projects and models are created on first
/// reference.
#[derive(Debug, Clone)]
pub struct Attribution {
    store: SqliteStore,
}

impl Attribution {
    /// Create a resolver over `store`
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Resolve the user behind the request's bearer key.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<User, ProxyError> {
        let key = bearer_key(headers);
        if key.is_empty() {
            return Err(ProxyError::Unauthorized);
        }

        match self.store.find_user_by_key(key).await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => Err(ProxyError::Unauthorized),
            Err(e) => Err(ProxyError::Internal(format!("failed to find user: {e}"))),
        }
    }

    /// Resolve (creating if needed) the project named by the request headers.
    pub async fn project(&self, user: User, headers: &HeaderMap) -> Result<CallContext, ProxyError> {
        let project = project_label(headers);
        let project_id = self
            .store
            .get_or_create_project(user.id, &project)
            .await
            .map_err(|e| ProxyError::Internal(format!("failed to find project: {e}")))?;

        Ok(CallContext {
            user,
            project,
            project_id,
        })
    }

    /// Resolve (creating if needed) the model row for `name`.
    pub async fn model(&self, name: &str) -> Result<ModelId, ProxyError> {
        self.store
            .get_or_create_model(name)
            .await
            .map_err(|e| ProxyError::Internal(format!("failed to get model {name}: {e}")))
    }
}

/// API key from `Authorization: Bearer <key>`; the raw header value when
/// the scheme is missing.
pub(crate) fn bearer_key(headers: &HeaderMap) -> &str {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    value.strip_prefix("Bearer ").unwrap_or(value).trim()
}

fn project_label(headers: &HeaderMap) -> String {
    headers
        .get(PROJECT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_PROJECT)
        .to_string()
}
