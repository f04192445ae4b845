use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::core::error::{AppError, Result};

/// Already-authenticated caller, supplied by the authentication layer in
/// front of this service.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Actor {
    pub id: Uuid,
    pub roles: Vec<String>,
}

impl Actor {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role("admin")
    }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<Actor>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("Actor not authenticated".to_string()))
    }
}

/// Opaque ownership links declared on an upload. Not interpreted here
/// beyond being handed to the access policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnershipRefs {
    pub project_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub stage_id: Option<Uuid>,
}

/// Permission predicate delegated to the authorization layer.
///
/// The upload subsystem never inspects project/client rows itself; it asks
/// this policy whether `actor` may touch the declared associations and
/// fails the operation with `Forbidden` when the answer is no.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn check_access(&self, refs: &OwnershipRefs, actor: &Actor) -> Result<()>;
}

/// Policy that allows every actor. Used when the service runs behind a
/// gateway that has already enforced resource-level permissions.
pub struct PermitAll;

#[async_trait]
impl AccessPolicy for PermitAll {
    async fn check_access(&self, _refs: &OwnershipRefs, _actor: &Actor) -> Result<()> {
        Ok(())
    }
}
