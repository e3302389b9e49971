use vmq_api::{ErrorKind, StoreError, TopicPartition};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("offset {offset} of {tp} is leased to another consumer")]
    AlreadyLeased { tp: TopicPartition, offset: u64 },

    #[error("member '{member}' holds no lease on offset {offset} of {tp}")]
    InvalidLease {
        tp: TopicPartition,
        offset: u64,
        member: String,
    },

    #[error("offset {offset} of {tp} is already settled")]
    AlreadySettled { tp: TopicPartition, offset: u64 },

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("member '{member}' is not in group '{group}'")]
    NotMember { group: String, member: String },

    #[error("{tp} is not assigned to member '{member}' of group '{group}'")]
    NotOwner {
        group: String,
        tp: TopicPartition,
        member: String,
    },

    #[error("group '{0}' is rebalancing")]
    RebalanceInProgress(String),

    #[error("partition {0} is offline")]
    PartitionOffline(TopicPartition),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Client-visible classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            BrokerError::AlreadyLeased { .. } => ErrorKind::AlreadyLeased,
            BrokerError::InvalidLease { .. } | BrokerError::NotOwner { .. } => ErrorKind::InvalidLease,
            BrokerError::AlreadySettled { .. } => ErrorKind::AlreadySettled,
            BrokerError::UnknownTopic(_) => ErrorKind::UnknownTopic,
            BrokerError::UnknownGroup(_) => ErrorKind::UnknownGroup,
            BrokerError::NotMember { .. } => ErrorKind::NotMember,
            BrokerError::RebalanceInProgress(_) => ErrorKind::RebalanceInProgress,
            BrokerError::PartitionOffline(_) => ErrorKind::PartitionOffline,
            BrokerError::InvalidRequest(_) | BrokerError::Config(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Add context to the error.
    ///
    /// For `StoreUnavailable`, context is added to the inner `StoreError`.
    /// For message-carrying variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            BrokerError::StoreUnavailable(e) => BrokerError::StoreUnavailable(e.with_context(ctx)),
            BrokerError::InvalidRequest(msg) => BrokerError::InvalidRequest(format!("{ctx}: {msg}")),
            BrokerError::Config(msg) => BrokerError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
