//! Payment gateway collaborator.
//!
//! The checkout flow talks to the gateway only through [`PaymentGateway`]. The HTTP
//! implementation speaks the v4 JSON protocol: a payment request returns an authority the
//! payer is redirected with, and the callback is confirmed with a verify call carrying the
//! same amount and authority.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::GatewayConfig;
use crate::errors::ServiceError;

const REQUEST_PATH: &str = "/pg/v4/payment/request.json";
const VERIFY_PATH: &str = "/pg/v4/payment/verify.json";

/// Every status code the gateway documents, plus a catch-all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayCode {
    ValidationFailed,
    InvalidMerchantOrIp,
    MerchantInactive,
    TooManyAttempts,
    TerminalSuspended,
    MerchantLevelInsufficient,
    FloatingFeeNotAllowed,
    SettlementAccountMissing,
    FloatingFeeExceedsLimit,
    FloatingFeePercentOutOfRange,
    FloatingFeeExceedsTotal,
    FloatingFeeRecipientLimit,
    InvalidExtraParams,
    AmountMismatch,
    PaymentFailed,
    UnexpectedError,
    SessionNotForMerchant,
    InvalidAuthority,
    Success,
    AlreadyVerified,
    Unknown(i32),
}

impl GatewayCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            -9 => Self::ValidationFailed,
            -10 => Self::InvalidMerchantOrIp,
            -11 => Self::MerchantInactive,
            -12 => Self::TooManyAttempts,
            -15 => Self::TerminalSuspended,
            -16 => Self::MerchantLevelInsufficient,
            -30 => Self::FloatingFeeNotAllowed,
            -31 => Self::SettlementAccountMissing,
            -32 => Self::FloatingFeeExceedsLimit,
            -33 => Self::FloatingFeePercentOutOfRange,
            -34 => Self::FloatingFeeExceedsTotal,
            -35 => Self::FloatingFeeRecipientLimit,
            -40 => Self::InvalidExtraParams,
            -50 => Self::AmountMismatch,
            -51 => Self::PaymentFailed,
            -52 => Self::UnexpectedError,
            -53 => Self::SessionNotForMerchant,
            -54 => Self::InvalidAuthority,
            100 => Self::Success,
            101 => Self::AlreadyVerified,
            other => Self::Unknown(other),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            Self::ValidationFailed => -9,
            Self::InvalidMerchantOrIp => -10,
            Self::MerchantInactive => -11,
            Self::TooManyAttempts => -12,
            Self::TerminalSuspended => -15,
            Self::MerchantLevelInsufficient => -16,
            Self::FloatingFeeNotAllowed => -30,
            Self::SettlementAccountMissing => -31,
            Self::FloatingFeeExceedsLimit => -32,
            Self::FloatingFeePercentOutOfRange => -33,
            Self::FloatingFeeExceedsTotal => -34,
            Self::FloatingFeeRecipientLimit => -35,
            Self::InvalidExtraParams => -40,
            Self::AmountMismatch => -50,
            Self::PaymentFailed => -51,
            Self::UnexpectedError => -52,
            Self::SessionNotForMerchant => -53,
            Self::InvalidAuthority => -54,
            Self::Success => 100,
            Self::AlreadyVerified => 101,
            Self::Unknown(code) => *code,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "request parameters failed gateway validation",
            Self::InvalidMerchantOrIp => "merchant id or caller ip is not valid",
            Self::MerchantInactive => "merchant account is inactive",
            Self::TooManyAttempts => "too many attempts, try again later",
            Self::TerminalSuspended => "payment terminal is suspended",
            Self::MerchantLevelInsufficient => "merchant level is too low for this request",
            Self::FloatingFeeNotAllowed => "floating fee settlement is not allowed",
            Self::SettlementAccountMissing => "settlement account is not registered",
            Self::FloatingFeeExceedsLimit => "floating fee exceeds the allowed limit",
            Self::FloatingFeePercentOutOfRange => "floating fee percentage is out of range",
            Self::FloatingFeeExceedsTotal => "floating fees exceed the total amount",
            Self::FloatingFeeRecipientLimit => "too many floating fee recipients",
            Self::InvalidExtraParams => "extra parameters are invalid",
            Self::AmountMismatch => "paid amount does not match the verified amount",
            Self::PaymentFailed => "payment was not completed",
            Self::UnexpectedError => "gateway reported an unexpected error",
            Self::SessionNotForMerchant => "payment session belongs to another merchant",
            Self::InvalidAuthority => "authority is not valid",
            Self::Success => "success",
            Self::AlreadyVerified => "payment was already verified",
            Self::Unknown(_) => "unrecognised gateway code",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(String),
    #[error("gateway did not answer in time")]
    Timeout,
    #[error("gateway returned an unreadable response: {0}")]
    InvalidResponse(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        ServiceError::PaymentGatewayError(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Payment session request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub amount: i64,
    pub callback_url: String,
    pub description: String,
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub order_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub code: GatewayCode,
    pub authority: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub code: GatewayCode,
    pub reference_id: Option<String>,
    pub card_mask: Option<String>,
    pub fee: Option<i64>,
    pub fee_type: Option<String>,
    /// Response body as received, kept for audit
    pub raw: Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn request_payment(&self, request: &PaymentRequest) -> Result<RequestOutcome, GatewayError>;

    async fn verify_payment(&self, amount: i64, authority: &str) -> Result<VerifyOutcome, GatewayError>;

    /// Where the payer is sent to complete the payment
    fn redirect_url(&self, authority: &str) -> String;
}

/// Reads the status code from `data.code`, falling back to `errors.code`
fn response_code(body: &Value) -> Result<GatewayCode, GatewayError> {
    body.pointer("/data/code")
        .and_then(Value::as_i64)
        .or_else(|| body.pointer("/errors/code").and_then(Value::as_i64))
        .map(|code| GatewayCode::from_code(code as i32))
        .ok_or_else(|| GatewayError::InvalidResponse("missing status code".to_string()))
}

fn string_field(body: &Value, pointer: &str) -> Option<String> {
    match body.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_request_response(body: &Value) -> Result<RequestOutcome, GatewayError> {
    Ok(RequestOutcome {
        code: response_code(body)?,
        authority: string_field(body, "/data/authority"),
        message: string_field(body, "/data/message").or_else(|| string_field(body, "/errors/message")),
    })
}

fn parse_verify_response(body: Value) -> Result<VerifyOutcome, GatewayError> {
    Ok(VerifyOutcome {
        code: response_code(&body)?,
        reference_id: string_field(&body, "/data/ref_id"),
        card_mask: string_field(&body, "/data/card_pan"),
        fee: body.pointer("/data/fee").and_then(Value::as_i64),
        fee_type: string_field(&body, "/data/fee_type"),
        raw: body,
    })
}

/// Gateway client over HTTP
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    config: GatewayConfig,
}

impl HttpPaymentGateway {
    /// Build a client bounded by the configured timeout
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to construct reqwest client for payment gateway")?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: GatewayConfig, client: Client) -> Self {
        Self { client, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, payload: Value) -> Result<Value, GatewayError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if status.is_server_error() {
            warn!(%status, "gateway server error");
            return Err(GatewayError::Transport(format!("gateway answered {}", status)));
        }
        // error codes arrive with 4xx statuses but still carry a parseable body
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(amount = request.amount, reference = %request.order_reference))]
    async fn request_payment(&self, request: &PaymentRequest) -> Result<RequestOutcome, GatewayError> {
        let payload = json!({
            "merchant_id": self.config.merchant_id,
            "amount": request.amount,
            "callback_url": request.callback_url,
            "description": request.description,
            "metadata": {
                "mobile": request.mobile,
                "email": request.email,
                "order_id": request.order_reference,
            },
        });
        let body = self.post(REQUEST_PATH, payload).await?;
        let outcome = parse_request_response(&body)?;
        debug!(code = outcome.code.as_i32(), "payment request answered");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn verify_payment(&self, amount: i64, authority: &str) -> Result<VerifyOutcome, GatewayError> {
        let payload = json!({
            "merchant_id": self.config.merchant_id,
            "amount": amount,
            "authority": authority,
        });
        let body = self.post(VERIFY_PATH, payload).await?;
        let outcome = parse_verify_response(body)?;
        debug!(code = outcome.code.as_i32(), "payment verify answered");
        Ok(outcome)
    }

    fn redirect_url(&self, authority: &str) -> String {
        format!("{}/{}", self.config.start_pay_url.trim_end_matches('/'), authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_documented_code_round_trips() {
        let codes = [
            -9, -10, -11, -12, -15, -16, -30, -31, -32, -33, -34, -35, -40, -50, -51, -52, -53,
            -54, 100, 101,
        ];
        for code in codes {
            let parsed = GatewayCode::from_code(code);
            assert!(!matches!(parsed, GatewayCode::Unknown(_)), "code {} unmapped", code);
            assert_eq!(parsed.as_i32(), code);
        }
        assert_eq!(GatewayCode::from_code(7), GatewayCode::Unknown(7));
        assert!(GatewayCode::Success.is_success());
        assert!(!GatewayCode::AlreadyVerified.is_success());
    }

    #[test]
    fn error_body_code_is_read_from_errors() {
        let body = json!({
            "data": [],
            "errors": { "code": -9, "message": "The input params invalid, validation error.", "validations": [] }
        });
        let outcome = parse_request_response(&body).unwrap();
        assert_eq!(outcome.code, GatewayCode::ValidationFailed);
        assert!(outcome.authority.is_none());
        assert!(outcome.message.is_some());
    }

    #[test]
    fn verify_body_extracts_reference_and_card() {
        let body = json!({
            "data": {
                "code": 100,
                "message": "Verified",
                "card_hash": "1EBE3EBEBE35C7EC0F8D6EE4F2F859107A87822CA179BC9528767EA7B5489B69",
                "card_pan": "502229******5995",
                "ref_id": 201,
                "fee_type": "Merchant",
                "fee": 0
            },
            "errors": []
        });
        let outcome = parse_verify_response(body).unwrap();
        assert_eq!(outcome.code, GatewayCode::Success);
        assert_eq!(outcome.reference_id.as_deref(), Some("201"));
        assert_eq!(outcome.card_mask.as_deref(), Some("502229******5995"));
        assert_eq!(outcome.fee, Some(0));
    }

    #[test]
    fn body_without_code_is_invalid() {
        assert!(matches!(
            parse_request_response(&json!({ "data": {} })),
            Err(GatewayError::InvalidResponse(_))
        ));
    }
}
