pub mod audit;
pub mod logging;
