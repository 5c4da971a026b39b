pub mod params;
pub mod schedule;

pub use schedule::{ChainConfig, Fork};
