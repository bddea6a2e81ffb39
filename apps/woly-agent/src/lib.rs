pub mod cnc;
pub mod config;
pub mod discovery;
pub mod events;
pub mod hostdb;
pub mod http;
pub mod mac_vendor;
pub mod wol;
