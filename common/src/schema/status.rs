use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of every payment record. `Confirmed`, `Failed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    AwaitingConfirmation,
    Confirmed,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Confirmed | PaymentStatus::Failed | PaymentStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::AwaitingConfirmation => "awaiting_confirmation",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(PaymentStatus::Created),
            "awaiting_confirmation" => Ok(PaymentStatus::AwaitingConfirmation),
            "confirmed" => Ok(PaymentStatus::Confirmed),
            "failed" => Ok(PaymentStatus::Failed),
            "expired" => Ok(PaymentStatus::Expired),
            other => Err(anyhow::anyhow!(
                "Unknown payment status '{}'. Expected one of: created, awaiting_confirmation, confirmed, failed, expired",
                other
            )),
        }
    }
}

/// Where a sale's money came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentSource {
    Stk,
    Manual,
    Qr,
}

impl PaymentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentSource::Stk => "stk",
            PaymentSource::Manual => "manual",
            PaymentSource::Qr => "qr",
        }
    }

    /// Table holding the payment record for this source.
    pub(crate) fn payment_table(self) -> &'static str {
        match self {
            PaymentSource::Stk => "pending_transactions",
            PaymentSource::Manual | PaymentSource::Qr => "manual_payments",
        }
    }
}

impl fmt::Display for PaymentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stk" => Ok(PaymentSource::Stk),
            "manual" => Ok(PaymentSource::Manual),
            "qr" => Ok(PaymentSource::Qr),
            other => Err(anyhow::anyhow!(
                "Unknown payment source '{}'. Expected stk, manual or qr",
                other
            )),
        }
    }
}

/// Operator-driven confirmation channels stored in `manual_payments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentChannel {
    Manual,
    Qr,
}

impl From<PaymentChannel> for PaymentSource {
    fn from(channel: PaymentChannel) -> Self {
        match channel {
            PaymentChannel::Manual => PaymentSource::Manual,
            PaymentChannel::Qr => PaymentSource::Qr,
        }
    }
}

impl FromStr for PaymentChannel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(PaymentChannel::Manual),
            "qr" => Ok(PaymentChannel::Qr),
            other => Err(anyhow::anyhow!(
                "Unknown payment channel '{}'. Expected manual or qr",
                other
            )),
        }
    }
}

/// What pollers see: enough to drive UI feedback without exposing the cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusView {
    pub id: String,
    pub status: PaymentStatus,
    pub receipt_number: Option<String>,
    pub result_desc: Option<String>,
    pub sale_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_final_states_are_terminal() {
        assert!(!PaymentStatus::Created.is_terminal());
        assert!(!PaymentStatus::AwaitingConfirmation.is_terminal());
        assert!(PaymentStatus::Confirmed.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Expired.is_terminal());
    }

    #[test]
    fn status_text_matches_serde() {
        let json = serde_json::to_string(&PaymentStatus::AwaitingConfirmation).unwrap();
        assert_eq!(json, "\"awaiting_confirmation\"");
        assert_eq!(
            "awaiting_confirmation".parse::<PaymentStatus>().unwrap(),
            PaymentStatus::AwaitingConfirmation
        );
        assert!("pending".parse::<PaymentStatus>().is_err());
    }
}
