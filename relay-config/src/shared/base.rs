use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// `max_cycles` cannot be zero.
    #[error("`max_cycles` cannot be zero")]
    MaxCyclesZero,
    /// `max_execution_minutes` cannot be zero.
    #[error("`max_execution_minutes` cannot be zero")]
    MaxExecutionMinutesZero,
    /// The trailing safety buffer must leave some time for the run itself.
    #[error(
        "`safety_buffer_secs` ({buffer_secs}s) must be smaller than the execution window ({window_secs}s)"
    )]
    SafetyBufferTooLarge { buffer_secs: u64, window_secs: u64 },
    /// Queries need a non-empty window.
    #[error("`query_interval_minutes` cannot be zero")]
    QueryIntervalZero,
    /// At least one attempt is needed for every store call.
    #[error("`retry.max_attempts` cannot be zero")]
    RetryAttemptsZero,
    /// The key-value store cannot be addressed without an account.
    #[error("`store.account_name` cannot be empty")]
    MissingStoreAccount,
    /// Requests to the store are signed with the account key.
    #[error("`store.account_key` cannot be empty")]
    MissingStoreKey,
    /// The analytical store cannot be addressed without a workspace.
    #[error("`analytics.workspace_id` cannot be empty")]
    MissingWorkspaceId,
}
