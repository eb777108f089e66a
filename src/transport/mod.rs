pub mod duplex;
pub mod platform;
