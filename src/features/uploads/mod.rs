pub mod access;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use access::{AccessPolicy, Actor, OwnershipRefs, PermitAll};
pub use routes::routes;
pub use services::UploadService;
