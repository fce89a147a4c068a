//! Identity resolution for job processing.
//!
//! Jobs are processed under the organization and user that created them. The
//! [`IdentityProvider`] resolves both from the job; the worker then makes the
//! result visible through [`crate::context::current_identity`] for exactly the
//! duration of the processing call.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::scheduler::Job;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

impl Organization {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub organization: String,
    pub roles: Vec<String>,
}

impl User {
    pub fn new(username: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            organization: organization.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// The security identity a job is processed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub organization: Organization,
    pub user: Option<User>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Look up an organization by id.
    async fn organization(&self, id: &str) -> Result<Organization>;

    /// Load a user of `organization`, `None` if there is no such user.
    async fn load_user(&self, username: &str, organization: &Organization) -> Result<Option<User>>;

    /// Resolve the identity a job must run under.
    ///
    /// Jobs without an organization run without identity. A creator unknown to
    /// the organization leaves the user empty.
    async fn resolve(&self, job: &Job) -> Result<Option<Identity>> {
        let Some(org_id) = job.organization.as_deref() else {
            return Ok(None);
        };
        let organization = self.organization(org_id).await?;
        let user = match job.creator.as_deref() {
            Some(creator) => {
                let user = self.load_user(creator, &organization).await?;
                if user.is_none() {
                    tracing::warn!(
                        job_id = %job.id,
                        creator,
                        organization = %organization.id,
                        "Job creator not found, processing without user"
                    );
                }
                user
            }
            None => None,
        };
        Ok(Some(Identity { organization, user }))
    }
}

/// Fixed set of organizations and users, built up front.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    organizations: HashMap<String, Organization>,
    users: HashMap<(String, String), User>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organization(mut self, organization: Organization) -> Self {
        self.organizations
            .insert(organization.id.clone(), organization);
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.users
            .insert((user.organization.clone(), user.username.clone()), user);
        self
    }
}

#[async_trait]
impl IdentityProvider for InMemoryDirectory {
    async fn organization(&self, id: &str) -> Result<Organization> {
        self.organizations
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::Identity(format!("unknown organization '{id}'")))
    }

    async fn load_user(&self, username: &str, organization: &Organization) -> Result<Option<User>> {
        Ok(self
            .users
            .get(&(organization.id.clone(), username.to_string()))
            .cloned())
    }
}
