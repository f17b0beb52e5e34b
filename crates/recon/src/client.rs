//! Payment API client.
//!
//! Three synchronous operations against the processor's NVP endpoint, each a
//! single blocking HTTPS round trip with a fixed one-minute timeout and no
//! retry at this layer. Every request/response pair is traced with the
//! credential fields masked. Nothing here mutates local state.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

use crate::config::ProcessorConfig;
use crate::error::{ReconError, ReconResult};
use crate::nvp::{self, NvpResponse, NA};
use crate::response::TransactionOutcome;

/// NVP API version sent with every request.
const API_VERSION: &str = "115";

/// Fixed request timeout. A slow processor surfaces as a transport error,
/// never as an in-process hang.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Placeholder URLs for operations that require them but never redirect.
const UNUSED_RETURN_URL: &str = "https://localhost/return";
const UNUSED_CANCEL_URL: &str = "https://localhost/cancel";

/// Result of creating a billing agreement from a checkout token.
#[derive(Debug, Clone)]
pub struct BillingAgreementResult {
    pub billing_agreement_id: String,
}

/// Parameters for charging a reference transaction.
#[derive(Debug, Clone)]
pub struct ReferenceCharge {
    pub amount_cents: i64,
    pub currency: String,
    pub invoice_number: String,
}

/// HTTP client for the processor's NVP API.
pub struct ProcessorClient {
    http: reqwest::Client,
    config: Arc<ProcessorConfig>,
    endpoint: String,
}

impl ProcessorClient {
    pub fn new(config: Arc<ProcessorConfig>) -> ReconResult<Self> {
        let endpoint = config.endpoint().to_string();
        Self::with_endpoint(config, endpoint)
    }

    /// Point the client at an explicit endpoint (used by tests against a
    /// stub server).
    pub fn with_endpoint(config: Arc<ProcessorConfig>, endpoint: String) -> ReconResult<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, config, endpoint })
    }

    /// Create a billing agreement from an approved checkout token.
    pub async fn create_billing_agreement(
        &self,
        token: &str,
    ) -> ReconResult<BillingAgreementResult> {
        let resp = self
            .request("CreateBillingAgreement", &[("TOKEN", token.to_string())])
            .await?;

        if !resp.is_success() {
            return Err(api_error(&resp));
        }

        let billing_agreement_id = resp
            .get("BILLINGAGREEMENTID")
            .ok_or_else(|| {
                ReconError::Validation("response missing BILLINGAGREEMENTID".to_string())
            })?
            .to_string();

        Ok(BillingAgreementResult { billing_agreement_id })
    }

    /// Charge a stored billing agreement.
    ///
    /// A `Failure` ACK is not an `Err`: the outcome carries the processor's
    /// error so the orchestrator can fail the order with a diagnostic note.
    /// Only transport problems surface as errors.
    pub async fn do_reference_transaction(
        &self,
        profile_id: &str,
        charge: &ReferenceCharge,
    ) -> ReconResult<TransactionOutcome> {
        let resp = self
            .request(
                "DoReferenceTransaction",
                &[
                    ("REFERENCEID", profile_id.to_string()),
                    ("PAYMENTACTION", "Sale".to_string()),
                    ("AMT", format_amount(charge.amount_cents)),
                    ("CURRENCYCODE", charge.currency.clone()),
                    ("INVNUM", charge.invoice_number.clone()),
                    // Ask for fraud filter details on held/denied payments.
                    ("RETURNFMFDETAILS", "1".to_string()),
                ],
            )
            .await?;

        Ok(TransactionOutcome::from_nvp(&resp))
    }

    /// Whether the account can run merchant-initiated reference
    /// transactions. Probes with a checkout setup request carrying the
    /// merchant-initiated billing type; accounts without the capability get
    /// a `Failure` ACK instead of a token.
    pub async fn check_capability(&self) -> ReconResult<bool> {
        let resp = self
            .request(
                "SetExpressCheckout",
                &[
                    ("RETURNURL", UNUSED_RETURN_URL.to_string()),
                    ("CANCELURL", UNUSED_CANCEL_URL.to_string()),
                    ("BILLINGTYPE", "MerchantInitiatedBilling".to_string()),
                    ("AMT", "0".to_string()),
                ],
            )
            .await?;

        Ok(resp.is_success() && resp.get("TOKEN").is_some())
    }

    async fn request(&self, method: &str, params: &[(&str, String)]) -> ReconResult<NvpResponse> {
        let credentials = &self.config.credentials;
        let mut pairs: Vec<(&str, &str)> = vec![
            ("METHOD", method),
            ("VERSION", API_VERSION),
            ("USER", &credentials.username),
            ("PWD", &credentials.password),
            ("SIGNATURE", &credentials.signature),
        ];
        pairs.extend(params.iter().map(|(k, v)| (*k, v.as_str())));
        let body = nvp::encode(pairs);

        tracing::debug!(
            method = method,
            endpoint = %self.endpoint,
            body = %nvp::sanitize(&body),
            "processor request"
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        tracing::debug!(
            method = method,
            http_status = %status,
            body = %text,
            "processor response"
        );

        Ok(NvpResponse::parse(&text))
    }
}

fn api_error(resp: &NvpResponse) -> ReconError {
    ReconError::Api {
        code: resp.error_code().unwrap_or(NA).to_string(),
        message: resp
            .long_message()
            .or_else(|| resp.short_message())
            .unwrap_or(NA)
            .to_string(),
    }
}

/// Render a cent amount as the decimal string the NVP API expects.
pub fn format_amount(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::response::PaymentStatus;

    fn test_config() -> Arc<ProcessorConfig> {
        Arc::new(ProcessorConfig::new(
            Credentials {
                username: "merchant_api1.example.com".into(),
                password: "hunter2".into(),
                signature: "SIG".into(),
            },
            true,
        ))
    }

    fn client_for(server: &mockito::ServerGuard) -> ProcessorClient {
        ProcessorClient::with_endpoint(test_config(), format!("{}/nvp", server.url())).unwrap()
    }

    #[test]
    fn amounts_render_with_two_decimal_places() {
        assert_eq!(format_amount(1999), "19.99");
        assert_eq!(format_amount(500), "5.00");
        assert_eq!(format_amount(7), "0.07");
    }

    #[tokio::test]
    async fn create_billing_agreement_reads_agreement_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/nvp")
            .with_body("ACK=Success&BILLINGAGREEMENTID=B-8HX12345AB")
            .expect(1)
            .create_async()
            .await;

        let result = client_for(&server)
            .create_billing_agreement("EC-4RW12345XY")
            .await
            .unwrap();

        assert_eq!(result.billing_agreement_id, "B-8HX12345AB");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn create_billing_agreement_surfaces_processor_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/nvp")
            .with_body("ACK=Failure&L_ERRORCODE0=11455&L_LONGMESSAGE0=Buyer%20did%20not%20accept")
            .create_async()
            .await;

        let err = client_for(&server)
            .create_billing_agreement("EC-4RW12345XY")
            .await
            .unwrap_err();

        match err {
            ReconError::Api { code, message } => {
                assert_eq!(code, "11455");
                assert_eq!(message, "Buyer did not accept");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reference_transaction_parses_approved_outcome() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/nvp")
            .with_body("ACK=Success&PAYMENTSTATUS=Completed&TRANSACTIONID=8XY12345&PAYMENTTYPE=instant")
            .create_async()
            .await;

        let charge = ReferenceCharge {
            amount_cents: 1999,
            currency: "USD".into(),
            invoice_number: "PS-42".into(),
        };
        let outcome = client_for(&server)
            .do_reference_transaction("B-8HX12345AB", &charge)
            .await
            .unwrap();

        assert!(outcome.approved());
        assert_eq!(outcome.transaction_id.as_deref(), Some("8XY12345"));
    }

    #[tokio::test]
    async fn reference_transaction_failure_is_an_outcome_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/nvp")
            .with_body("ACK=Failure&L_ERRORCODE0=10201&L_LONGMESSAGE0=Agreement%20canceled")
            .create_async()
            .await;

        let charge = ReferenceCharge {
            amount_cents: 1999,
            currency: "USD".into(),
            invoice_number: "PS-42".into(),
        };
        let outcome = client_for(&server)
            .do_reference_transaction("B-8HX12345AB", &charge)
            .await
            .unwrap();

        assert!(!outcome.approved());
        assert_eq!(outcome.status, PaymentStatus::Unknown);
        let err = outcome.api_error.unwrap();
        assert_eq!(err.code, "10201");
    }

    #[tokio::test]
    async fn check_capability_true_when_token_issued() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/nvp")
            .with_body("ACK=Success&TOKEN=EC-1AB23456CD")
            .create_async()
            .await;

        assert!(client_for(&server).check_capability().await.unwrap());
    }

    #[tokio::test]
    async fn check_capability_false_on_failure_ack() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/nvp")
            .with_body("ACK=Failure&L_ERRORCODE0=11452&L_SHORTMESSAGE0=Merchant%20not%20enabled")
            .create_async()
            .await;

        assert!(!client_for(&server).check_capability().await.unwrap());
    }

    #[tokio::test]
    async fn request_body_carries_credentials_and_method() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/nvp")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("METHOD".into(), "SetExpressCheckout".into()),
                mockito::Matcher::UrlEncoded("USER".into(), "merchant_api1.example.com".into()),
                mockito::Matcher::UrlEncoded("VERSION".into(), API_VERSION.into()),
                mockito::Matcher::UrlEncoded("BILLINGTYPE".into(), "MerchantInitiatedBilling".into()),
            ]))
            .with_body("ACK=Success&TOKEN=EC-1")
            .create_async()
            .await;

        client_for(&server).check_capability().await.unwrap();
        mock.assert_async().await;
    }
}
