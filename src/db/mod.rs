pub mod points;

pub use points::SqlitePointsLedger;
