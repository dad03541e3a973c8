use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use conductor_btp::{
    DataHandler, Link, LinkError, MoneyHandler, ProtocolData, PROTOCOL_CCP_CONTROL,
    PROTOCOL_CCP_UPDATE, PROTOCOL_ILP, PROTOCOL_INVOICE_REQUEST, PROTOCOL_INVOICE_RESPONSE,
    PROTOCOL_PEERING_REQUEST, PROTOCOL_PEERING_RESPONSE,
};
use conductor_ccp::{CcpSender, CcpTransportError, RouteControlRequest, RouteManager, RouteUpdateRequest};
use conductor_packet::{ErrorCode, Packet, Reject, RejectBuilder};
use conductor_rates::StaticRateBackend;
use conductor_router::Switch;
use conductor_service::{
    AccountId, AddressStore, IlpResult, IncomingRequest, IncomingService, OutgoingRequest,
    OutgoingService,
};
use conductor_service_util::{
    DeduplicateService, ExchangeRateService, ExpiryShortenerService, MaxPacketAmountService,
    RateLimiter, RateLimitService, ThroughputService, ValidatorService,
};
use conductor_settlement::{
    ArtifactRequester, BalanceService, BalanceStore, EngineIdentity, InvoiceRequest,
    InvoiceResponse, SettlementAccount, SettlementController, SettlementEngine, SettlementError,
};
use conductor_store::{ConnectorAccount, MemoryStore, StoreError};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectorConfig;

const SUBPROTOCOL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("account {0} is not registered")]
    UnknownAccount(String),
    #[error("account {0} is already connected")]
    AlreadyConnected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The assembled incoming pipeline as a callable, so handlers can hold it
/// without naming the (deeply nested) chain type.
type IlpHandler =
    Arc<dyn Fn(IncomingRequest<ConnectorAccount>) -> BoxFuture<'static, IlpResult> + Send + Sync>;

/// The set of open links, used both as the outgoing pipeline terminal and
/// for addressed sends (CCP, settlement).
#[derive(Clone, Default)]
struct LinkManager {
    links: Arc<RwLock<HashMap<AccountId, Link<ConnectorAccount>>>>,
}

impl LinkManager {
    fn get(&self, account_id: &AccountId) -> Option<Link<ConnectorAccount>> {
        self.links.read().get(account_id).cloned()
    }

    fn insert(&self, account_id: AccountId, link: Link<ConnectorAccount>) {
        self.links.write().insert(account_id, link);
    }

    fn remove(&self, account_id: &AccountId) -> Option<Link<ConnectorAccount>> {
        self.links.write().remove(account_id)
    }

    fn contains(&self, account_id: &AccountId) -> bool {
        self.links.read().contains_key(account_id)
    }
}

#[async_trait]
impl OutgoingService<ConnectorAccount> for LinkManager {
    async fn send_request(&mut self, request: OutgoingRequest<ConnectorAccount>) -> IlpResult {
        use conductor_service::Account;
        match self.get(request.to.id()) {
            Some(mut link) => link.send_request(request).await,
            None => {
                trace!("No open link for account {}", request.to.id());
                Err(RejectBuilder {
                    code: ErrorCode::T01_PEER_UNREACHABLE,
                    message: b"no open connection for account",
                    triggered_by: None,
                    data: &[],
                }
                .build())
            }
        }
    }
}

/// Sends routing messages over the peer's link.
#[derive(Clone)]
struct LinkCcpSender {
    links: LinkManager,
}

impl LinkCcpSender {
    async fn send(
        &self,
        to: &ConnectorAccount,
        protocol: &'static str,
        payload: Vec<u8>,
    ) -> Result<(), CcpTransportError> {
        use conductor_service::Account;
        let link = self
            .links
            .get(to.id())
            .ok_or_else(|| CcpTransportError::SendFailed("no open link".to_string()))?;
        link.request(
            vec![ProtocolData::octet_stream(protocol, payload)],
            SUBPROTOCOL_REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
        .map_err(|err| CcpTransportError::SendFailed(err.to_string()))
    }
}

#[async_trait]
impl CcpSender<ConnectorAccount> for LinkCcpSender {
    async fn send_control(
        &self,
        to: &ConnectorAccount,
        request: RouteControlRequest,
    ) -> Result<(), CcpTransportError> {
        self.send(to, PROTOCOL_CCP_CONTROL, request.to_bytes()).await
    }

    async fn send_update(
        &self,
        to: &ConnectorAccount,
        request: RouteUpdateRequest,
    ) -> Result<(), CcpTransportError> {
        self.send(to, PROTOCOL_CCP_UPDATE, request.to_bytes()).await
    }
}

/// Runs the settlement sub-protocols over the peer's link.
#[derive(Clone)]
struct LinkSettlementPeer {
    links: LinkManager,
}

#[async_trait]
impl ArtifactRequester for LinkSettlementPeer {
    async fn request_artifact(
        &self,
        account_id: &AccountId,
        amount: u64,
    ) -> Result<InvoiceResponse, SettlementError> {
        let link = self.links.get(account_id).ok_or_else(|| {
            SettlementError::ArtifactUnavailable("no open link".to_string())
        })?;
        let payload = serde_json::to_vec(&InvoiceRequest { amount })
            .expect("invoice requests always serialize");

        let response = link
            .request(
                vec![ProtocolData::json(PROTOCOL_INVOICE_REQUEST, payload)],
                SUBPROTOCOL_REQUEST_TIMEOUT,
            )
            .await
            .map_err(|err| SettlementError::ArtifactUnavailable(err.to_string()))?;

        let entry = response
            .into_iter()
            .find(|entry| entry.protocol_name == PROTOCOL_INVOICE_RESPONSE)
            .ok_or_else(|| {
                SettlementError::ArtifactUnavailable("peer sent no invoice".to_string())
            })?;
        serde_json::from_slice(&entry.data)
            .map_err(|err| SettlementError::ArtifactUnavailable(err.to_string()))
    }

    async fn notify_paid(
        &self,
        account_id: &AccountId,
        invoice_id: &str,
        amount: u64,
    ) -> Result<(), SettlementError> {
        let link = self.links.get(account_id).ok_or_else(|| {
            SettlementError::ArtifactUnavailable("no open link".to_string())
        })?;
        link.send_money(
            amount,
            vec![ProtocolData::octet_stream(
                PROTOCOL_INVOICE_RESPONSE,
                invoice_id.as_bytes().to_vec(),
            )],
        )
        .await
        .map(|_| ())
        .map_err(|err| SettlementError::PaymentFailed(err.to_string()))
    }
}

/// Demultiplexes inbound MESSAGE frames by sub-protocol name.
struct NodeDataHandler<E> {
    incoming: IlpHandler,
    route_manager: RouteManager<MemoryStore, LinkCcpSender>,
    store: MemoryStore,
    engine: E,
}

impl<E: Clone> Clone for NodeDataHandler<E> {
    fn clone(&self) -> Self {
        NodeDataHandler {
            incoming: self.incoming.clone(),
            route_manager: self.route_manager.clone(),
            store: self.store.clone(),
            engine: self.engine.clone(),
        }
    }
}

#[async_trait]
impl<E> DataHandler<ConnectorAccount> for NodeDataHandler<E>
where
    E: SettlementEngine,
{
    async fn handle_data(
        &self,
        from: ConnectorAccount,
        protocol_data: Vec<ProtocolData>,
    ) -> Result<Vec<ProtocolData>, LinkError> {
        use conductor_service::Account;
        let mut response = Vec::new();
        for entry in protocol_data {
            match entry.protocol_name.as_ref() {
                PROTOCOL_ILP => {
                    let prepare = match Packet::try_from(BytesMut::from(&entry.data[..])) {
                        Ok(Packet::Prepare(prepare)) => prepare,
                        Ok(_) => {
                            return Err(LinkError::Protocol(
                                "expected an ILP Prepare".to_string(),
                            ))
                        }
                        Err(err) => return Err(LinkError::Protocol(err.to_string())),
                    };
                    let result = (self.incoming)(IncomingRequest {
                        from: from.clone(),
                        prepare,
                    })
                    .await;
                    let packet = match result {
                        Ok(fulfill) => Packet::Fulfill(fulfill),
                        Err(reject) => Packet::Reject(reject),
                    };
                    response.push(ProtocolData::octet_stream(
                        PROTOCOL_ILP,
                        BytesMut::from(packet).to_vec(),
                    ));
                }
                PROTOCOL_CCP_CONTROL => {
                    let control = match RouteControlRequest::from_bytes(&entry.data) {
                        Ok(control) => control,
                        Err(err) => {
                            // a peer speaking garbage gets reset to SYNC
                            self.route_manager.reset_peer(&from).await;
                            return Err(LinkError::Protocol(err.to_string()));
                        }
                    };
                    self.route_manager
                        .handle_route_control(&from, control)
                        .await
                        .map_err(|err| LinkError::Protocol(err.to_string()))?;
                }
                PROTOCOL_CCP_UPDATE => {
                    let update = match RouteUpdateRequest::from_bytes(&entry.data) {
                        Ok(update) => update,
                        Err(err) => {
                            self.route_manager.reset_peer(&from).await;
                            return Err(LinkError::Protocol(err.to_string()));
                        }
                    };
                    self.route_manager
                        .handle_route_update(&from, update)
                        .await
                        .map_err(|err| LinkError::Protocol(err.to_string()))?;
                }
                PROTOCOL_PEERING_REQUEST => {
                    let identity: EngineIdentity = serde_json::from_slice(&entry.data)
                        .map_err(|err| LinkError::Protocol(err.to_string()))?;
                    debug!(
                        "Peered with account {}: engine {} at {}",
                        from.id(),
                        identity.engine_identity,
                        identity.engine_endpoint
                    );
                    if let Some(tracker) = self.store.balance_tracker(from.id()) {
                        tracker.set_remote_engine_identity(identity.engine_identity);
                    }
                    let ours = serde_json::to_vec(&self.engine.identity())
                        .expect("engine identities always serialize");
                    response.push(ProtocolData::json(PROTOCOL_PEERING_RESPONSE, ours));
                }
                PROTOCOL_INVOICE_REQUEST => {
                    let request: InvoiceRequest = serde_json::from_slice(&entry.data)
                        .map_err(|err| LinkError::Protocol(err.to_string()))?;
                    let invoice = self
                        .engine
                        .issue_invoice(request.amount)
                        .await
                        .map_err(|err| LinkError::Protocol(err.to_string()))?;
                    if let Some(tracker) = self.store.balance_tracker(from.id()) {
                        tracker.note_issued_invoice(invoice.id.clone());
                    }
                    let payload = serde_json::to_vec(&invoice)
                        .expect("invoices always serialize");
                    response.push(ProtocolData::json(PROTOCOL_INVOICE_RESPONSE, payload));
                }
                other => {
                    warn!(
                        "Ignoring unknown sub-protocol {} from account {}",
                        other,
                        from.id()
                    );
                }
            }
        }
        Ok(response)
    }
}

/// Applies inbound TRANSFER frames to the account's balance. Shares the
/// data pipeline's token buckets, so a peer cannot dodge its rate limit by
/// switching to the money protocol.
#[derive(Clone)]
struct NodeMoneyHandler {
    store: MemoryStore,
    rate_limiter: RateLimiter,
}

#[async_trait]
impl MoneyHandler<ConnectorAccount> for NodeMoneyHandler {
    async fn handle_money(
        &self,
        from: ConnectorAccount,
        amount: u64,
        protocol_data: Vec<ProtocolData>,
    ) -> Result<Vec<ProtocolData>, LinkError> {
        use conductor_service::Account;
        use conductor_service_util::RateLimitAccount;

        if let Some(params) = from.rate_limit() {
            if !self.rate_limiter.check(from.id(), &params) {
                return Err(LinkError::Protocol("rate limit exceeded".to_string()));
            }
        }

        let tracker = self
            .store
            .balance_tracker(from.id())
            .ok_or_else(|| LinkError::Protocol("unknown account".to_string()))?;

        let invoice_id = protocol_data
            .iter()
            .find(|entry| entry.protocol_name == PROTOCOL_INVOICE_RESPONSE)
            .map(|entry| String::from_utf8_lossy(&entry.data).into_owned());

        match tracker.receive_settlement(invoice_id.as_deref(), amount) {
            Ok(true) => {
                info!(
                    "Account {} settled {} to us; balance is now {}",
                    from.id(),
                    amount,
                    tracker.balance()
                );
                Ok(Vec::new())
            }
            // a duplicate notification is acknowledged but has no effect
            Ok(false) => Ok(Vec::new()),
            Err(err) => Err(LinkError::Protocol(err.to_string())),
        }
    }
}

/// The connector.
///
/// Owns the store, the rate backend, the route manager and the settlement
/// controllers, and attaches peer links to the packet pipeline as accounts
/// connect.
pub struct Connector<E: SettlementEngine> {
    store: MemoryStore,
    engine: E,
    links: LinkManager,
    route_manager: RouteManager<MemoryStore, LinkCcpSender>,
    incoming: IlpHandler,
    controllers: Arc<Mutex<HashMap<AccountId, SettlementController<E, LinkSettlementPeer>>>>,
    settle_sender: mpsc::UnboundedSender<AccountId>,
    rate_limiter: RateLimiter,
}

impl<E: SettlementEngine> Connector<E> {
    /// Boots the node: registers configured accounts, assembles the
    /// pipelines, and spawns the store writer, the settlement loop and the
    /// route broadcast loop.
    pub fn new(config: ConnectorConfig, engine: E) -> Result<Self, NodeError> {
        let store = MemoryStore::new(config.ilp_address.clone());
        for account_config in config.accounts.iter().cloned() {
            store.add_account(account_config.into_account())?;
        }

        let rates = StaticRateBackend::new(config.rate_table());
        let links = LinkManager::default();
        let route_manager = RouteManager::new(
            config.ilp_address.clone(),
            store.clone(),
            LinkCcpSender {
                links: links.clone(),
            },
        )
        .route_expiry(config.route_expiry_interval())
        .hold_down_time(config.hold_down_time_ms);

        let (settle_sender, mut settle_receiver) = mpsc::unbounded_channel::<AccountId>();

        // outgoing data chain, innermost (the link) first
        let outgoing = links.clone();
        let outgoing = ValidatorService::outgoing(store.clone(), outgoing);
        let outgoing = ThroughputService::new(store.clone(), outgoing);
        let outgoing = BalanceService::new(store.clone(), Some(settle_sender.clone()), outgoing);
        let outgoing = DeduplicateService::new(store.clone(), outgoing);
        let outgoing = ExpiryShortenerService::new(store.clone(), config.min_message_window(), outgoing);
        let outgoing = ExchangeRateService::new(store.clone(), rates, outgoing);

        // incoming data chain around the switch
        let switch =
            Switch::new(store.clone(), outgoing).with_reflect_payments(config.reflect_payments);
        let incoming = ThroughputService::new(store.clone(), switch);
        let incoming = MaxPacketAmountService::new(store.clone(), incoming);
        let rate_limiter = RateLimiter::new();
        let incoming = RateLimitService::new(store.clone(), rate_limiter.clone(), incoming);
        let incoming = ValidatorService::incoming(store.clone(), incoming);

        // outermost error handler: no failure leaves the node without a
        // reject, and every reject names who triggered it
        let chain = incoming;
        let ilp_address = config.ilp_address.clone();
        let incoming: IlpHandler = Arc::new(move |request| {
            let mut chain = chain.clone();
            let ilp_address = ilp_address.clone();
            Box::pin(async move {
                chain
                    .handle_request(request)
                    .await
                    .map_err(|reject| stamp_triggered_by(reject, &ilp_address))
            })
        });

        let controllers: Arc<Mutex<HashMap<AccountId, SettlementController<E, LinkSettlementPeer>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // the settlement loop: balance changes nudge account ids through
        // the channel; each one gets a (single-flight) controller trigger
        {
            let controllers = controllers.clone();
            tokio::spawn(async move {
                while let Some(account_id) = settle_receiver.recv().await {
                    let controller = controllers.lock().get(&account_id).cloned();
                    if let Some(controller) = controller {
                        tokio::spawn(async move { controller.trigger().await });
                    }
                }
            });
        }

        {
            let writer = store.clone();
            tokio::spawn(async move { writer.process_writes().await });
        }

        {
            let broadcaster = route_manager.clone();
            let interval = config.route_broadcast_interval();
            tokio::spawn(async move { broadcaster.start_broadcast_loop(interval).await });
        }

        info!("Connector listening as {}", store.get_ilp_address());
        Ok(Connector {
            store,
            engine,
            links,
            route_manager,
            incoming,
            controllers,
            settle_sender,
            rate_limiter,
        })
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Shared token buckets, so money-protocol servicing can draw from the
    /// same per-account limit as the data pipeline.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Registers an account at runtime (admin call).
    pub fn add_account(&self, account: ConnectorAccount) -> Result<(), NodeError> {
        self.store.add_account(account)?;
        self.route_manager.update_best_routes(None);
        Ok(())
    }

    /// Removes an account, disconnecting it first if necessary.
    pub fn remove_account(&self, account_id: &AccountId) -> Result<(), NodeError> {
        if self.links.contains(account_id) {
            self.disconnect_account(account_id);
        }
        self.store.remove_account(account_id)?;
        self.route_manager.update_best_routes(None);
        Ok(())
    }

    /// Attaches a transport to a registered account: builds the link,
    /// starts servicing both peer roles on it, and kicks off route
    /// exchange and (if configured) an initial settlement check.
    pub fn connect_account(
        &self,
        account_id: &AccountId,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<(), NodeError> {
        let account = self
            .store
            .account(account_id)
            .ok_or_else(|| NodeError::UnknownAccount(account_id.to_string()))?;
        if self.links.contains(account_id) {
            return Err(NodeError::AlreadyConnected(account_id.to_string()));
        }

        let link = Link::new(account.clone(), outgoing, incoming);
        link.start(
            NodeDataHandler {
                incoming: self.incoming.clone(),
                route_manager: self.route_manager.clone(),
                store: self.store.clone(),
                engine: self.engine.clone(),
            },
            NodeMoneyHandler {
                store: self.store.clone(),
                rate_limiter: self.rate_limiter.clone(),
            },
        );
        self.links.insert(account_id.clone(), link);

        let tracker = self
            .store
            .balance_tracker(account_id)
            .expect("registered accounts always have a tracker");
        let controller = SettlementController::new(
            tracker,
            self.engine.clone(),
            LinkSettlementPeer {
                links: self.links.clone(),
            },
        );
        self.controllers
            .lock()
            .insert(account_id.clone(), controller);

        debug!("Account {} connected", account_id);
        self.route_manager.update_best_routes(None);
        {
            let route_manager = self.route_manager.clone();
            let account = account.clone();
            tokio::spawn(async move { route_manager.peer_connected(&account).await });
        }
        if account.settle_on_connect() {
            // reuse the settlement loop so the trigger stays single-flight
            let _ = self.settle_sender.send(account_id.clone());
        }
        Ok(())
    }

    /// Detaches an account's transport and withdraws its advertised
    /// routes. The account itself stays registered.
    pub fn disconnect_account(&self, account_id: &AccountId) {
        if self.links.remove(account_id).is_some() {
            debug!("Account {} disconnected", account_id);
        }
        self.controllers.lock().remove(account_id);
        self.route_manager.peer_disconnected(account_id);
    }
}

fn stamp_triggered_by(reject: Reject, ilp_address: &conductor_packet::Address) -> Reject {
    if reject.triggered_by().is_some() {
        reject
    } else {
        RejectBuilder {
            code: reject.code(),
            message: reject.message(),
            triggered_by: Some(ilp_address),
            data: reject.data(),
        }
        .build()
    }
}
