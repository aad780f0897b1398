pub use cancel_token::*;
pub use core_pinner::*;
pub use health_flag::*;

mod cancel_token;
pub mod config_io;
mod core_pinner;
mod health_flag;
pub mod logger;
