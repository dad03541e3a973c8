use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use conductor_packet::{ErrorCode, Packet, RejectBuilder};
use conductor_service::{Account, IlpResult, OutgoingRequest, OutgoingService};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::packet::{
    BtpError, BtpMessage, BtpPacket, BtpResponse, BtpTransfer, ProtocolData, Serializable,
};
use crate::PROTOCOL_ILP;

/// Extra time an ILP request may wait on the wire beyond the packet's own
/// expiry, covering clock skew and the final hop back.
const RESPONSE_GRACE_PERIOD: Duration = Duration::from_secs(1);
/// Deadline for money-protocol and other non-ILP exchanges, which carry no
/// expiry of their own.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("request timed out")]
    TimedOut,
    #[error("request id already in flight")]
    RequestIdCollision,
    #[error("peer returned error {code}: {message}")]
    Remote { code: String, message: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Handles inbound MESSAGE frames. The node's implementation demultiplexes
/// on the sub-protocol names and feeds `ilp` entries into the incoming
/// pipeline.
#[async_trait]
pub trait DataHandler<A: Account>: Clone + Send + Sync + 'static {
    async fn handle_data(
        &self,
        from: A,
        protocol_data: Vec<ProtocolData>,
    ) -> Result<Vec<ProtocolData>, LinkError>;
}

/// Handles inbound TRANSFER frames, i.e. the peer crediting us on the
/// settlement layer.
#[async_trait]
pub trait MoneyHandler<A: Account>: Clone + Send + Sync + 'static {
    async fn handle_money(
        &self,
        from: A,
        amount: u64,
        protocol_data: Vec<ProtocolData>,
    ) -> Result<Vec<ProtocolData>, LinkError>;
}

type PendingResult = Result<Vec<ProtocolData>, LinkError>;
type PendingRequests = Arc<Mutex<HashMap<u32, oneshot::Sender<PendingResult>>>>;

/// One side of a bilateral peer connection.
///
/// A link owns the pending-request table for its transport: egress requests
/// insert an entry keyed by a random 32-bit request id and await it under a
/// deadline; the reader task resolves entries as RESPONSE/ERROR frames
/// arrive. A response arriving after its deadline finds no entry and is
/// discarded.
pub struct Link<A: Account> {
    account: A,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
    pending: PendingRequests,
}

impl<A: Account> Clone for Link<A> {
    fn clone(&self) -> Self {
        Link {
            account: self.account.clone(),
            outgoing: self.outgoing.clone(),
            incoming: self.incoming.clone(),
            pending: self.pending.clone(),
        }
    }
}

/// Creates two links joined by in-process frame pipes. `left_peer` is the
/// account the left link speaks for (i.e. the peer as seen by the left
/// node), and vice versa.
pub fn link_pair<A: Account + Sync + 'static>(left_peer: A, right_peer: A) -> (Link<A>, Link<A>) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
        Link::new(left_peer, left_tx, left_rx),
        Link::new(right_peer, right_tx, right_rx),
    )
}

impl<A> Link<A>
where
    A: Account + Sync + 'static,
{
    pub fn new(
        account: A,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Link {
            account,
            outgoing,
            incoming: Arc::new(Mutex::new(Some(incoming))),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn account(&self) -> &A {
        &self.account
    }

    /// Spawns the reader task feeding inbound frames to the given handlers.
    ///
    /// # Panics
    ///
    /// Panics if called a second time for the same transport.
    pub fn start<D, M>(&self, data_handler: D, money_handler: M)
    where
        D: DataHandler<A>,
        M: MoneyHandler<A>,
    {
        let mut incoming = self
            .incoming
            .lock()
            .take()
            .expect("link reader can only be started once");
        let account = self.account.clone();
        let outgoing = self.outgoing.clone();
        let pending = self.pending.clone();

        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                let packet = match BtpPacket::from_bytes(&frame) {
                    Ok(packet) => packet,
                    Err(err) => {
                        warn!(
                            "Discarding malformed frame from account {}: {}",
                            account.id(),
                            err
                        );
                        continue;
                    }
                };

                match packet {
                    BtpPacket::Message(message) => {
                        // requests are handled concurrently; ordering past
                        // this point is not preserved
                        tokio::spawn(respond_to_message(
                            account.clone(),
                            data_handler.clone(),
                            outgoing.clone(),
                            message,
                        ));
                    }
                    BtpPacket::Transfer(transfer) => {
                        tokio::spawn(respond_to_transfer(
                            account.clone(),
                            money_handler.clone(),
                            outgoing.clone(),
                            transfer,
                        ));
                    }
                    BtpPacket::Response(response) => {
                        resolve_pending(
                            &pending,
                            response.request_id,
                            Ok(response.protocol_data),
                        );
                    }
                    BtpPacket::Error(error) => {
                        debug!(
                            "Got error frame from account {} for request {}: {} {}",
                            account.id(),
                            error.request_id,
                            error.code,
                            error.data
                        );
                        resolve_pending(
                            &pending,
                            error.request_id,
                            Err(LinkError::Remote {
                                code: error.code,
                                message: error.data,
                            }),
                        );
                    }
                }
            }
            debug!("Link transport for account {} closed", account.id());
        });
    }

    /// Sends a MESSAGE frame and awaits the matching response under the
    /// given deadline. On expiry the pending entry is freed so a late
    /// response is discarded rather than delivered.
    pub async fn request(
        &self,
        protocol_data: Vec<ProtocolData>,
        timeout: Duration,
    ) -> PendingResult {
        let request_id = rand::random::<u32>();
        let message = BtpMessage {
            request_id,
            protocol_data,
        };
        self.send_and_await(request_id, message.to_bytes(), timeout)
            .await
    }

    /// Sends a TRANSFER frame notifying the peer of `amount` moving on the
    /// settlement layer.
    pub async fn send_money(
        &self,
        amount: u64,
        protocol_data: Vec<ProtocolData>,
    ) -> PendingResult {
        let request_id = rand::random::<u32>();
        let transfer = BtpTransfer {
            request_id,
            amount,
            protocol_data,
        };
        self.send_and_await(request_id, transfer.to_bytes(), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    async fn send_and_await(
        &self,
        request_id: u32,
        frame: Vec<u8>,
        timeout: Duration,
    ) -> PendingResult {
        let receiver = {
            let mut pending = self.pending.lock();
            match pending.entry(request_id) {
                // 32-bit randomness makes this nearly impossible; reject
                // the new caller rather than clobbering the in-flight entry
                Entry::Occupied(_) => return Err(LinkError::RequestIdCollision),
                Entry::Vacant(slot) => {
                    let (sender, receiver) = oneshot::channel();
                    slot.insert(sender);
                    receiver
                }
            }
        };

        if self.outgoing.send(frame).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(LinkError::Closed);
        }
        trace!(
            "Sent request {} to account {}",
            request_id,
            self.account.id()
        );

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(LinkError::Closed),
            Err(_elapsed) => {
                self.pending.lock().remove(&request_id);
                trace!(
                    "Request {} to account {} timed out after {:?}",
                    request_id,
                    self.account.id(),
                    timeout
                );
                Err(LinkError::TimedOut)
            }
        }
    }
}

fn resolve_pending(pending: &PendingRequests, request_id: u32, result: PendingResult) {
    if let Some(sender) = pending.lock().remove(&request_id) {
        // the awaiting future may have been dropped in the meantime
        let _ = sender.send(result);
    } else {
        trace!(
            "Discarding response for request {} with no pending entry (expired or duplicate)",
            request_id
        );
    }
}

async fn respond_to_message<A, D>(
    account: A,
    data_handler: D,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    message: BtpMessage,
) where
    A: Account + Sync + 'static,
    D: DataHandler<A>,
{
    let request_id = message.request_id;
    let reply = match data_handler
        .handle_data(account.clone(), message.protocol_data)
        .await
    {
        Ok(protocol_data) => BtpResponse {
            request_id,
            protocol_data,
        }
        .to_bytes(),
        Err(err) => {
            debug!(
                "Data handler failed for request {} from account {}: {}",
                request_id,
                account.id(),
                err
            );
            error_frame(request_id, &err).to_bytes()
        }
    };
    if outgoing.send(reply).is_err() {
        error!(
            "Could not send response for request {} to account {}: link closed",
            request_id,
            account.id()
        );
    }
}

async fn respond_to_transfer<A, M>(
    account: A,
    money_handler: M,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    transfer: BtpTransfer,
) where
    A: Account + Sync + 'static,
    M: MoneyHandler<A>,
{
    let request_id = transfer.request_id;
    let reply = match money_handler
        .handle_money(account.clone(), transfer.amount, transfer.protocol_data)
        .await
    {
        Ok(protocol_data) => BtpResponse {
            request_id,
            protocol_data,
        }
        .to_bytes(),
        Err(err) => {
            debug!(
                "Money handler failed for transfer {} from account {}: {}",
                request_id,
                account.id(),
                err
            );
            error_frame(request_id, &err).to_bytes()
        }
    };
    if outgoing.send(reply).is_err() {
        error!(
            "Could not send response for transfer {} to account {}: link closed",
            request_id,
            account.id()
        );
    }
}

fn error_frame(request_id: u32, err: &LinkError) -> BtpError {
    BtpError {
        request_id,
        code: "T00".to_string(),
        name: "InternalError".to_string(),
        triggered_at: Utc::now(),
        data: err.to_string(),
        protocol_data: Vec::new(),
    }
}

#[async_trait]
impl<A> OutgoingService<A> for Link<A>
where
    A: Account + Sync + 'static,
{
    /// Frames the prepare under the `ilp` sub-protocol and awaits the
    /// response. The deadline is the packet's own expiry plus a grace
    /// period; the expiry middleware enforces the tighter hop timeout.
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        let timeout = request
            .prepare
            .expires_at()
            .duration_since(SystemTime::now())
            .unwrap_or_default()
            + RESPONSE_GRACE_PERIOD;

        let ilp_entry = ProtocolData::octet_stream(
            PROTOCOL_ILP,
            BytesMut::from(request.prepare).to_vec(),
        );

        let result = self.request(vec![ilp_entry], timeout).await;
        let protocol_data = match result {
            Ok(protocol_data) => protocol_data,
            Err(LinkError::TimedOut) => {
                return Err(RejectBuilder {
                    code: ErrorCode::R00_TRANSFER_TIMED_OUT,
                    message: &[],
                    triggered_by: None,
                    data: &[],
                }
                .build())
            }
            Err(LinkError::RequestIdCollision) => {
                return Err(RejectBuilder {
                    code: ErrorCode::T00_INTERNAL_ERROR,
                    message: b"request id already in flight",
                    triggered_by: None,
                    data: &[],
                }
                .build())
            }
            Err(err) => {
                debug!(
                    "Error sending ILP request to account {}: {}",
                    request.to.id(),
                    err
                );
                return Err(RejectBuilder {
                    code: ErrorCode::T01_PEER_UNREACHABLE,
                    message: err.to_string().as_bytes(),
                    triggered_by: None,
                    data: &[],
                }
                .build());
            }
        };

        let ilp_response = protocol_data
            .into_iter()
            .find(|entry| entry.protocol_name == PROTOCOL_ILP);
        let packet = ilp_response
            .ok_or(())
            .and_then(|entry| Packet::try_from(BytesMut::from(&entry.data[..])).map_err(|_| ()));

        match packet {
            Ok(Packet::Fulfill(fulfill)) => Ok(fulfill),
            Ok(Packet::Reject(reject)) => Err(reject),
            _ => Err(RejectBuilder {
                code: ErrorCode::T00_INTERNAL_ERROR,
                message: b"Response did not carry an ILP packet",
                triggered_by: None,
                data: &[],
            }
            .build()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_packet::{Address, FulfillBuilder, PrepareBuilder};
    use conductor_service::{AccountId, AccountRelation};
    use once_cell::sync::Lazy;
    use std::str::FromStr;

    #[derive(Clone, Debug)]
    struct TestAccount;

    static TEST_ID: Lazy<AccountId> = Lazy::new(|| AccountId::from_str("peer-0").unwrap());

    impl Account for TestAccount {
        fn id(&self) -> &AccountId {
            &TEST_ID
        }

        fn relation(&self) -> AccountRelation {
            AccountRelation::Peer
        }

        fn asset_code(&self) -> &str {
            "XYZ"
        }

        fn asset_scale(&self) -> u8 {
            9
        }
    }

    #[derive(Clone)]
    struct EchoHandler;

    #[async_trait]
    impl DataHandler<TestAccount> for EchoHandler {
        async fn handle_data(
            &self,
            _from: TestAccount,
            protocol_data: Vec<ProtocolData>,
        ) -> Result<Vec<ProtocolData>, LinkError> {
            Ok(protocol_data)
        }
    }

    #[derive(Clone)]
    struct FulfillingHandler;

    #[async_trait]
    impl DataHandler<TestAccount> for FulfillingHandler {
        async fn handle_data(
            &self,
            _from: TestAccount,
            _protocol_data: Vec<ProtocolData>,
        ) -> Result<Vec<ProtocolData>, LinkError> {
            let fulfill = FulfillBuilder {
                fulfillment: &[0; 32],
                data: b"ok",
            }
            .build();
            Ok(vec![ProtocolData::octet_stream(
                PROTOCOL_ILP,
                BytesMut::from(fulfill.as_ref()).to_vec(),
            )])
        }
    }

    #[derive(Clone)]
    struct SilentHandler;

    #[async_trait]
    impl DataHandler<TestAccount> for SilentHandler {
        async fn handle_data(
            &self,
            _from: TestAccount,
            _protocol_data: Vec<ProtocolData>,
        ) -> Result<Vec<ProtocolData>, LinkError> {
            // never answers within any reasonable deadline
            tokio::time::delay_for(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[derive(Clone)]
    struct CountingMoneyHandler(Arc<Mutex<u64>>);

    #[async_trait]
    impl MoneyHandler<TestAccount> for CountingMoneyHandler {
        async fn handle_money(
            &self,
            _from: TestAccount,
            amount: u64,
            _protocol_data: Vec<ProtocolData>,
        ) -> Result<Vec<ProtocolData>, LinkError> {
            *self.0.lock() += amount;
            Ok(Vec::new())
        }
    }

    fn test_prepare(expires_in: Duration) -> conductor_packet::Prepare {
        PrepareBuilder {
            destination: Address::from_str("example.destination").unwrap(),
            amount: 100,
            execution_condition: &[0; 32],
            expires_at: SystemTime::now() + expires_in,
            data: &[],
        }
        .build()
    }

    #[tokio::test]
    async fn round_trips_a_request() {
        let (local, remote) = link_pair(TestAccount, TestAccount);
        local.start(EchoHandler, CountingMoneyHandler(Default::default()));
        remote.start(EchoHandler, CountingMoneyHandler(Default::default()));

        let reply = local
            .request(
                vec![ProtocolData::octet_stream("test", b"hello".to_vec())],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply[0].data, b"hello");
    }

    #[tokio::test]
    async fn sends_ilp_prepares_and_returns_fulfills() {
        let (mut local, remote) = link_pair(TestAccount, TestAccount);
        local.start(EchoHandler, CountingMoneyHandler(Default::default()));
        remote.start(FulfillingHandler, CountingMoneyHandler(Default::default()));

        let fulfill = local
            .send_request(OutgoingRequest {
                from: TestAccount,
                to: TestAccount,
                original_amount: 100,
                prepare: test_prepare(Duration::from_secs(5)),
            })
            .await
            .unwrap();
        assert_eq!(fulfill.data(), b"ok");
    }

    #[tokio::test]
    async fn expired_requests_reject_r00_and_free_the_entry() {
        let (mut local, remote) = link_pair(TestAccount, TestAccount);
        local.start(EchoHandler, CountingMoneyHandler(Default::default()));
        remote.start(SilentHandler, CountingMoneyHandler(Default::default()));

        let reject = local
            .send_request(OutgoingRequest {
                from: TestAccount,
                to: TestAccount,
                original_amount: 100,
                prepare: test_prepare(Duration::from_millis(20)),
            })
            .await
            .unwrap_err();
        assert_eq!(reject.code(), ErrorCode::R00_TRANSFER_TIMED_OUT);
        assert!(local.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn transfers_reach_the_money_handler() {
        let received = Arc::new(Mutex::new(0));
        let (local, remote) = link_pair(TestAccount, TestAccount);
        local.start(EchoHandler, CountingMoneyHandler(Default::default()));
        remote.start(EchoHandler, CountingMoneyHandler(received.clone()));

        local.send_money(250, Vec::new()).await.unwrap();
        assert_eq!(*received.lock(), 250);
    }

    #[tokio::test]
    async fn closed_links_reject_t01() {
        let (mut local, remote) = link_pair(TestAccount, TestAccount);
        drop(remote);

        let reject = local
            .send_request(OutgoingRequest {
                from: TestAccount,
                to: TestAccount,
                original_amount: 100,
                prepare: test_prepare(Duration::from_secs(5)),
            })
            .await
            .unwrap_err();
        assert_eq!(reject.code(), ErrorCode::T01_PEER_UNREACHABLE);
    }
}
