pub mod client;
pub mod error;
pub mod key;
pub mod models;

pub use client::{PanelApi, PanelClient};
pub use error::PanelError;
pub use key::generate_connection_key;
pub use models::{AddedClient, ClientTraffic, Inbound, InboundClient};

/// Host part of a panel URL, used when a server has no explicit host.
pub fn panel_host(panel_url: &str) -> Option<String> {
    url::Url::parse(panel_url).ok()?.host_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panel_host_strips_scheme_port_and_path() {
        assert_eq!(panel_host("https://panel.example.com:2053/xui"), Some("panel.example.com".into()));
        assert_eq!(panel_host("not a url"), None);
    }
}
