// Database connection management

pub mod pool;

pub use pool::DbPool;
