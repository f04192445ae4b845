#[cfg(test)]
use crate::features::uploads::access::Actor;

#[cfg(test)]
use axum::{extract::Request, middleware::Next, response::Response, Router};

#[cfg(test)]
use uuid::Uuid;

#[cfg(test)]
#[allow(dead_code)]
pub fn create_admin_actor() -> Actor {
    Actor {
        id: Uuid::new_v4(),
        roles: vec!["admin".to_string()],
    }
}

#[cfg(test)]
#[allow(dead_code)]
async fn inject_admin_actor_middleware(mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(create_admin_actor());
    next.run(request).await
}

#[cfg(test)]
#[allow(dead_code)]
pub fn with_admin_actor(router: Router) -> Router {
    router.layer(axum::middleware::from_fn(inject_admin_actor_middleware))
}
