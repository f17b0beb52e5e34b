//! Response parser and status classifier.
//!
//! Pure functions from a raw NVP response to a structured
//! [`TransactionOutcome`]. This layer never validates: missing fields become
//! sentinels and unrecognized statuses become [`PaymentStatus::Unknown`].
//! The orchestrator decides what to do with the result.

use serde::Serialize;

use crate::nvp::{NvpResponse, NA};

/// Error code: payment held for review by the account's fraud filters.
const FMF_PENDING_CODE: &str = "11610";
/// Error code: payment denied by the account's fraud filters.
const FMF_DENY_CODE: &str = "11611";

/// Fraud filter detail fields are indexed; the processor caps the list.
const FMF_MAX_INDEX: usize = 10;

/// Normalized payment status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaymentStatus {
    Completed,
    Processed,
    InProgress,
    Pending,
    Denied,
    Unknown,
}

impl PaymentStatus {
    /// Case-insensitive parse. Anything unrecognized maps to `Unknown`;
    /// the caller logs and ignores those rather than failing the delivery.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "completed" => PaymentStatus::Completed,
            "processed" => PaymentStatus::Processed,
            "in-progress" | "in_progress" => PaymentStatus::InProgress,
            "pending" => PaymentStatus::Pending,
            "denied" => PaymentStatus::Denied,
            _ => PaymentStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "completed",
            PaymentStatus::Processed => "processed",
            PaymentStatus::InProgress => "in-progress",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Denied => "denied",
            PaymentStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the payment is funded, as far as reconciliation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PaymentType {
    #[default]
    None,
    Echeck,
    Instant,
}

impl PaymentType {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "echeck" => PaymentType::Echeck,
            "instant" => PaymentType::Instant,
            _ => PaymentType::None,
        }
    }
}

/// A fraud filter the processor matched against the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FraudFilter {
    pub id: String,
    pub name: String,
}

/// Processor-reported failure attached to an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    /// `"<code> <message>"`, with the message forced to end in a period so
    /// order notes read as sentences.
    pub fn formatted(&self) -> String {
        let mut message = self.message.trim_end().to_string();
        if !message.ends_with('.') {
            message.push('.');
        }
        format!("{} {}", self.code, message)
    }
}

/// Normalized outcome of a charge attempt or payment notification.
#[derive(Debug, Clone, Default)]
pub struct TransactionOutcome {
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub pending_reason: Option<String>,
    pub payment_type: PaymentType,
    pub fraud_filters: Vec<FraudFilter>,
    /// Expected clearing date for eCheck payments, used in the status
    /// message only.
    pub echeck_clear_date: Option<String>,
    /// Present when the processor answered the charge with a `Failure` ACK.
    pub api_error: Option<ApiError>,
}

impl Default for PaymentStatus {
    fn default() -> Self {
        PaymentStatus::Unknown
    }
}

impl TransactionOutcome {
    pub fn approved(&self) -> bool {
        matches!(
            self.status,
            PaymentStatus::Completed | PaymentStatus::Processed | PaymentStatus::InProgress
        )
    }

    pub fn held(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    /// Human-readable summary for order notes. Held payments surface the
    /// pending reason, eChecks the expected clearing date, and any matched
    /// fraud filters are appended regardless of branch.
    pub fn status_message(&self) -> String {
        let mut message = if self.held() {
            self.pending_reason.clone().unwrap_or_else(|| NA.to_string())
        } else if self.payment_type == PaymentType::Echeck {
            format!(
                "eCheck payment, expected clearing date: {}",
                self.echeck_clear_date.as_deref().unwrap_or(NA)
            )
        } else {
            self.status.to_string()
        };

        for filter in &self.fraud_filters {
            message.push_str(&format!(" Fraud filter matched: {} ({}).", filter.name, filter.id));
        }

        message
    }

    /// Parse a charge response. Payment fields live under the parallel
    /// payment prefix at index 0 (parallel payments are unused, so the
    /// index is fixed), with flat-field fallback for older API versions.
    pub fn from_nvp(resp: &NvpResponse) -> Self {
        let status = PaymentStatus::parse(payment_field(resp, "PAYMENTSTATUS").unwrap_or(""));
        let payment_type = PaymentType::parse(payment_field(resp, "PAYMENTTYPE").unwrap_or(""));

        let api_error = if resp.is_success() {
            None
        } else {
            Some(ApiError {
                code: resp.error_code().unwrap_or(NA).to_string(),
                message: resp
                    .long_message()
                    .or_else(|| resp.short_message())
                    .unwrap_or(NA)
                    .to_string(),
            })
        };

        Self {
            status,
            transaction_id: payment_field(resp, "TRANSACTIONID").map(str::to_string),
            pending_reason: payment_field(resp, "PENDINGREASON")
                .filter(|r| !r.eq_ignore_ascii_case("none"))
                .map(str::to_string),
            payment_type,
            fraud_filters: extract_fraud_filters(resp),
            echeck_clear_date: payment_field(resp, "EXPECTEDECHECKCLEARDATE").map(str::to_string),
            api_error,
        }
    }
}

fn payment_field<'a>(resp: &'a NvpResponse, name: &str) -> Option<&'a str> {
    resp.get(&format!("PAYMENTINFO_0_{name}"))
        .or_else(|| resp.get(name))
}

/// Extract fraud filter details from a response.
///
/// Filter data is only present when the response carries the held-for-review
/// or denied-by-filters error code; plain declines return an empty list. An
/// entry is emitted only when both the id and name field exist for an index.
pub fn extract_fraud_filters(resp: &NvpResponse) -> Vec<FraudFilter> {
    let filter_type = match resp.error_code() {
        Some(FMF_PENDING_CODE) => "PENDING",
        Some(FMF_DENY_CODE) => "DENY",
        _ => return Vec::new(),
    };

    (0..FMF_MAX_INDEX)
        .filter_map(|index| {
            let id = resp.get(&format!("L_FMF{filter_type}ID{index}"))?;
            let name = resp.get(&format!("L_FMF{filter_type}NAME{index}"))?;
            Some(FraudFilter {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}
