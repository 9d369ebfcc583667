mod legacy;
mod warehouse;

pub use legacy::LegacyAdapter;
pub use warehouse::WarehouseAdapter;
