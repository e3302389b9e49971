use vmq_api::StoreError;
use vmq_engine::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("{0}")]
    Broker(#[from] BrokerError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
