pub mod clock;
pub mod config;
pub mod cookies;
pub mod errors;

pub use clock::{Clock, ClockHandle, ManualClock, SystemClock};
pub use config::{CookieConfig, CookiePolicy};
pub use cookies::{Cookie, CookieFilter, CookieManager, CookieRecord};
pub use errors::{CookieParseError, StoreError};
