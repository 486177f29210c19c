pub mod client;
pub mod params;
pub mod rate_limiter;

pub use client::PortalClient;
pub use params::{FundType, ReportType, SearchCriteria};
