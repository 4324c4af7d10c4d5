pub mod egx_market;
