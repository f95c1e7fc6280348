pub mod store;

pub use store::SqliteHistoryStore;
