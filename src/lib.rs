//! Stock reservation and trade lifecycle core for a farmer/purchaser trade
//! platform: demand → docking → contract → order, with an atomic stock
//! reservation engine and a background expiry sweeper.

pub mod audit;
pub mod contract;
pub mod demand;
pub mod error;
pub mod order;
pub mod product;
pub mod reservation;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod timestamp;
pub mod utils;
