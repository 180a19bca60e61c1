pub mod asset_locks;
pub mod asset_store;
pub mod store_node;
pub mod versioning;
