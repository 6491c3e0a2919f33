#[macro_use]
pub mod macros;
pub mod address;
pub mod constants;
pub mod conversions;
pub mod logger;
pub mod memory;
pub mod rand;

pub use self::address::Address;
