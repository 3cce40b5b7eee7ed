//! Ports: boundaries to external collaborators.
//!
//! - **Clock**: current time, for credential expiry checks
//! - **TokenExchange**: refresh token exchange (the HTTP layer lives outside this crate)

pub mod clock;
pub mod exchange;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::exchange::{TokenExchange, TokenGrant};
