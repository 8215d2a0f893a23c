pub mod chain;
pub mod error;
pub mod index;
pub mod logging;
pub mod pool;
pub mod swap;
