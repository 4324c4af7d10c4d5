pub mod contract;
pub mod recommend;
pub mod stock;
