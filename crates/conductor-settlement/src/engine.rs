use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a settlement engine introduces itself to the peer's engine,
/// exchanged over the `peeringRequest`/`peeringResponse` sub-protocols.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineIdentity {
    /// Stable identity on the settlement layer (e.g. a node pubkey)
    pub engine_identity: String,
    /// Where the engine can be reached on that layer
    pub engine_endpoint: String,
}

/// Asks the peer for a payment artifact covering `amount`, sent as the
/// `invoiceRequest` sub-protocol payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRequest {
    pub amount: u64,
}

/// A payment artifact issued by the peer's engine, returned as the
/// `invoiceResponse` sub-protocol payload. The artifact itself is opaque
/// to the connector; the decoded destination identity is included so the
/// payer can check the artifact actually pays the peer it owes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceResponse {
    /// Identifier used to match the eventual incoming credit
    pub id: String,
    /// Engine-specific payment request (opaque)
    pub artifact: String,
    /// The identity the artifact pays out to
    pub destination_identity: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("could not issue invoice: {0}")]
    InvoiceFailed(String),
}

/// The capability set a concrete value-transfer backend (Lightning
/// daemon, payment channel, test double) exposes to the connector. The
/// machinery behind it is out of scope here.
#[async_trait]
pub trait SettlementEngine: Clone + Send + Sync + 'static {
    /// This engine's identity, shared with peers while peering.
    fn identity(&self) -> EngineIdentity;

    /// Issues an artifact the peer can pay to settle `amount` with us.
    async fn issue_invoice(&self, amount: u64) -> Result<InvoiceResponse, EngineError>;

    /// Pays the given artifact. Implementations may take arbitrarily long;
    /// the controller bounds the wait and treats a timeout as failure.
    async fn pay(&self, invoice: &InvoiceResponse, amount: u64) -> Result<(), EngineError>;
}
