pub mod handlers;
pub mod inventory;
mod proxy;
pub mod router;
pub mod routes;
pub mod watch;

pub use handlers::{ApiError, AppState, Reason};
pub use routes::{ApiDoc, create_router};
