pub mod acl;
pub mod config;
pub mod proxy;
pub mod state;
pub mod stats;
