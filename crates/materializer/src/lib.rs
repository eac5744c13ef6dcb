//! Segment publication: staging writes, atomic swaps into per-rule output
//! tables, and the segment catalog.

pub mod catalog;
pub mod clickhouse_warehouse;
pub mod warehouse;
pub mod writer;

pub use catalog::{PublishRecord, SegmentCatalogEntry};
pub use clickhouse_warehouse::ClickHouseWarehouse;
pub use warehouse::{InMemoryWarehouse, SegmentWarehouse};
pub use writer::{MaterializationWriter, PublishRequest};
