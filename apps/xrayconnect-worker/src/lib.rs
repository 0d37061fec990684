pub mod config;
pub mod error;
pub mod panels;
pub mod provisioning;
pub mod sweep;

pub use error::{Stage, TaskError};
pub use panels::{HttpPanelConnector, PanelConnector};
pub use provisioning::Provisioner;
pub use sweep::TrafficSweep;
