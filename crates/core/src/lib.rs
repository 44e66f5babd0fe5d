//! WoM Core
//!
//! Records, error taxonomy, addresses and the document store seam shared by
//! every WoM crate.

pub mod address;
pub mod amount;
pub mod model;
pub mod store;

pub use address::Address;
pub use model::*;
pub use store::{DocumentStore, MemoryStore, StoreError, StoreResult};

use thiserror::Error;

/// Machine-readable error codes surfaced to callers.
pub mod codes {
    pub const INVALID_ADDRESS: &str = "wom.invalidAddress";
    pub const MALFORMED_PAYLOAD: &str = "wom.malformedPayload";
    pub const EMPTY_HUB_ADDRESS: &str = "wom.emptyHubAddress";
    pub const EMPTY_SIGNED_MESSAGE: &str = "wom.emptySignedMessage";
    pub const INVALID_SIGNED_MESSAGE: &str = "wom.invalidSignedMessage";
    pub const WRONG_SIGNATURE_HASH: &str = "wom.wrongSignatureHash";
    pub const EMPTY_DEED_MANAGER_ADDRESS: &str = "wom.emptyDeedManagerAddress";
    pub const EMPTY_TOKEN: &str = "wom.emptyTokenForSignedMessage";
    pub const INVALID_TOKEN: &str = "wom.invalidTokenForSignedMessage";

    pub const HUB_NOT_CONNECTED: &str = "wom.hubNotConnectedToWoM";
    pub const HUB_DOES_NOT_EXIST: &str = "wom.hubDoesNotExist";
    pub const HUB_MANAGER_CHANGED: &str = "wom.hubManagerChangedNoReportReceived";
    pub const REPORT_BEFORE_CONNECTION: &str = "wom.sentReportIsBeforeWoMConnection";
    pub const REPORT_BEFORE_UEM: &str = "wom.sentReportIsBeforeUEM";
    pub const REPORT_BEFORE_LAST_REWARDED: &str = "wom.sentReportIsBeforeLastRewardedReport";
    pub const UNSUPPORTED_REWARD_CONTRACT: &str = "wom.unsupporedRewardContract";

    pub const DEED_ALREADY_USED: &str = "wom.deedAlreadyUsedByAHub";
    pub const ONLY_HUB_OWNER: &str = "wom.onlyHubOwnerCanManageWoMConnection";
    pub const ONLY_MANAGER_CAN_UPDATE_DEED: &str = "wom.onlyManagerCanUpdateDeed";
    pub const NOT_DEED_OWNER: &str = "wom.notDeedOwner";
    pub const NOT_DEED_MANAGER: &str = "wom.notDeedManager";
    pub const ALREADY_DISCONNECTED: &str = "wom.alreadyDisconnected";
    pub const NO_LEASE_FOUND: &str = "wom.noLeaseFound";
    pub const DEED_NOT_FOUND: &str = "wom.deedNotFound";
    pub const INVALID_DEED: &str = "wom.invalidDeed";
    pub const INVALID_NEW_OWNER: &str = "wom.invalidNewHubOwner";

    pub const HUB_USERS_MANDATORY: &str = "wom.hubUsersIsMandatory";
    pub const HUB_PARTICIPANTS_MANDATORY: &str = "wom.hubParticipantsCountIsMandatory";
    pub const HUB_ACHIEVEMENTS_MANDATORY: &str = "wom.hubAchievementsCountIsMandatory";
    pub const HUB_REWARD_AMOUNT_MANDATORY: &str = "wom.hubUsedRewardAmountIsMandatory";
    pub const NOT_ELIGIBLE_TO_DATE: &str = "wom.hubReportHasNotEligibleToDate";
    pub const HUB_ALREADY_REPORTED: &str = "wom.hubAlreadySentReportInCurrentPeriod";
    pub const DEED_ALREADY_REPORTED: &str = "wom.deedAlreadySentReportInCurrentPeriod";
    pub const FROM_DATE_NOT_INCREASING: &str = "wom.lastReportFromDateMustBeLessThanCurrentReportFromDate";
    pub const HUB_NOT_CONNECTED_USING_DEED: &str = "wom.hubIsNotConnectedToWoMUsingDeed";
    pub const REWARD_PERIOD_CLOSED: &str = "wom.rewardPeriodClosed";
    pub const REWARD_PERIOD_NOT_ENDED: &str = "wom.rewardPeriodNotEnded";
    pub const REWARD_PERIOD_NOT_FOUND: &str = "wom.rewardPeriodNotFound";
    pub const REWARD_PERIOD_OUTDATED: &str = "wom.rewardPeriodOutdated";

    pub const INVALID_CLAIM_AMOUNT: &str = "uem.invalidClaimAmount";
    pub const ONLY_HUB_CAN_REPORT: &str = "uem.onlyHubCanSendUEMReport";

    pub const CODE_GENERATION_LIMIT: &str = "auth.codeGenerationLimitExceeded";
    pub const CODE_SENDING_LIMIT: &str = "auth.maxCodeSendingReached";
    pub const CODE_VERIFICATION_LIMIT: &str = "auth.maxCodeVerificationReached";
    pub const INVALID_CODE: &str = "auth.invalidCode";
}

/// Broad category of a [`WomError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parsing,
    Authorization,
    Request,
    Transient,
    Anomaly,
}

/// Errors surfaced by the federation and reward engine.
///
/// `Parsing`, `Authorization` and `Request` carry a code from [`codes`] and are
/// permanent for the submission that raised them. `Transient` and `Store`
/// failures are retried on the next scheduled tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WomError {
    #[error("malformed payload [{0}]")]
    Parsing(String),
    #[error("authorization refused [{0}]")]
    Authorization(String),
    #[error("request rejected [{0}]")]
    Request(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("reconciliation anomaly: {0}")]
    Anomaly(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl WomError {
    pub fn parsing(code: &str) -> Self {
        Self::Parsing(code.to_string())
    }

    pub fn authorization(code: &str) -> Self {
        Self::Authorization(code.to_string())
    }

    pub fn request(code: &str) -> Self {
        Self::Request(code.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parsing(_) => ErrorKind::Parsing,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::Request(_) => ErrorKind::Request,
            Self::Transient(_) | Self::Store(_) => ErrorKind::Transient,
            Self::Anomaly(_) => ErrorKind::Anomaly,
        }
    }

    /// The machine-readable code, or a generic one for infrastructure failures.
    pub fn code(&self) -> &str {
        match self {
            Self::Parsing(code) | Self::Authorization(code) | Self::Request(code) => code,
            Self::Transient(_) | Self::Store(_) => "wom.transientFailure",
            Self::Anomaly(_) => "wom.reconciliationAnomaly",
        }
    }

    pub fn should_retry(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, WomError>;

/// Current unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_and_retry() {
        let err = WomError::request(codes::HUB_ALREADY_REPORTED);
        assert_eq!(err.kind(), ErrorKind::Request);
        assert_eq!(err.code(), codes::HUB_ALREADY_REPORTED);
        assert!(!err.should_retry());

        let err = WomError::from(StoreError::Unavailable("down".into()));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.should_retry());
    }

    #[test]
    fn test_error_display_carries_code() {
        let err = WomError::authorization(codes::INVALID_SIGNED_MESSAGE);
        assert_eq!(
            err.to_string(),
            "authorization refused [wom.invalidSignedMessage]"
        );
    }
}
