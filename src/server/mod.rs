pub mod engine;
pub mod router;

pub use router::{StorefrontState, storefront_router};
