use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("panel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("panel returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("panel rejected request: {0}")]
    Api(String),

    #[error("panel login failed: {0}")]
    Login(String),

    #[error("malformed panel payload: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PanelError>;
