//! Cookies: [`CookieParser`], the [`CookieNode`] domain index, the
//! [`CookieManager`] policy engine and the [`CookieBackingStore`] persistence.

mod cookie;
mod date;
mod manager;
mod node;
mod parser;
mod public_suffix;
mod scheduler;
mod store;

pub use cookie::Cookie;
pub use cookie::CookieFilter;
pub use cookie::CookieRecord;
pub use cookie::MAX_COOKIE_SIZE;

pub use date::parse_cookie_date;
pub use parser::default_path;
pub use parser::CookieParser;
pub use public_suffix::is_top_level_domain;

pub use node::AddOutcome;
pub use node::CookieNode;
pub use node::NodeKey;

pub use manager::path_matches;
pub use manager::BackingStorePolicy;
pub use manager::CookieManager;

pub use scheduler::DeferredTask;

pub use store::CookieBackingStore;
pub use store::CookieTable;
pub use store::PendingWrite;
pub use store::WriteAction;
