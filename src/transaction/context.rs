//! Caller identity for one pipeline run
//!
//! The context is built once, before `handle`, and is read-only inside the
//! pipeline. It can come from an [`AuthenticationProvider`] or be
//! assembled directly by the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What an authentication layer knows about the calling application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationContext {
    pub application_id: String,
    pub application_name: String,
    pub permissions: BTreeSet<String>,
    pub session_id: Option<String>,
}

/// Source of the ambient authentication context
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    /// `None` when the caller is not authenticated
    async fn current_context(&self) -> Option<AuthenticationContext>;
}

/// Provider that always answers with the same context
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticationProvider {
    context: Option<AuthenticationContext>,
}

impl StaticAuthenticationProvider {
    pub fn new(context: AuthenticationContext) -> Self {
        Self {
            context: Some(context),
        }
    }

    pub fn unauthenticated() -> Self {
        Self { context: None }
    }
}

#[async_trait]
impl AuthenticationProvider for StaticAuthenticationProvider {
    async fn current_context(&self) -> Option<AuthenticationContext> {
        self.context.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionContext {
    application_id: Option<String>,
    application_name: Option<String>,
    user_id: Option<String>,
    permissions: BTreeSet<String>,
    session_id: Option<String>,
    environment: String,
}

impl TransactionContext {
    /// Authenticated application context
    pub fn new(application_id: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            application_id: Some(application_id.into()),
            application_name: Some(application_name.into()),
            user_id: None,
            permissions: BTreeSet::new(),
            session_id: None,
            environment: "production".to_string(),
        }
    }

    /// Context with no identity; fails any authentication requirement
    pub fn anonymous() -> Self {
        Self {
            application_id: None,
            application_name: None,
            user_id: None,
            permissions: BTreeSet::new(),
            session_id: None,
            environment: "production".to_string(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.application_id.is_some()
    }

    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Required permissions this context lacks, in sorted order
    pub fn missing_permissions<'a>(&'a self, required: &'a BTreeSet<String>) -> Vec<&'a str> {
        required
            .difference(&self.permissions)
            .map(String::as_str)
            .collect()
    }
}

impl From<AuthenticationContext> for TransactionContext {
    fn from(auth: AuthenticationContext) -> Self {
        Self {
            application_id: Some(auth.application_id),
            application_name: Some(auth.application_name),
            user_id: None,
            permissions: auth.permissions,
            session_id: auth.session_id,
            environment: "production".to_string(),
        }
    }
}
