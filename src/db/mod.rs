mod postgres;
mod sqlite;
mod store;

pub use postgres::PostgresRowStore;
pub use sqlite::SqliteRowStore;
pub use store::RowStore;
