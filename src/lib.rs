pub mod accessors;
pub mod cache;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod identifier;
pub mod metrics;
pub mod middleware;
pub mod quota;
pub mod rate_limiter;
pub mod response;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod sweeper;
pub mod validation;

pub use accessors::CachedQuery;
pub use cache::CacheManager;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use handlers::AppState;
pub use quota::{QuotaPolicy, QuotaTable};
pub use rate_limiter::RateLimiter;
pub use runtime::Runtime;
pub use server::create_app;
