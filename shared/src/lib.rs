pub mod dns;
pub mod error;
pub mod ip6;
pub mod protocol;
pub mod txt;
pub mod types;

pub use error::{Error, Result};
