//! # conductor-service
//!
//! The core abstraction every conductor pipeline is built from.
//!
//! All of the packet-handling components are "services" that take a request
//! carrying an ILP Prepare packet and the related account(s) and
//! asynchronously return either a Fulfill or a Reject. Middlewares wrap an
//! inner service and forward to it; terminal services (links, local
//! handlers) answer directly. Because every component speaks the same
//! interface, chains are composed once at account-connect time by plain
//! nesting.
//!
//! An incoming request only knows which account it arrived from. The switch
//! resolves the next hop and turns it into an outgoing request, which knows
//! both sides.

use async_trait::async_trait;
use conductor_packet::{Fulfill, Prepare, Reject};
use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

mod account;
pub use account::{AccountId, AccountIdError, AccountRelation};

/// Result wrapper over [`Fulfill`] and [`Reject`]
pub type IlpResult = Result<Fulfill, Reject>;

/// The base trait that per-concern account traits extend.
///
/// A concrete account type (see `conductor-store`) carries every configured
/// attribute; services only see the traits they need.
pub trait Account: Clone + Send + Sized + Debug {
    fn id(&self) -> &AccountId;
    fn relation(&self) -> AccountRelation;
    fn asset_code(&self) -> &str;
    fn asset_scale(&self) -> u8;
}

/// An ILP Prepare packet on its way in, before the next hop is known.
#[derive(Clone)]
pub struct IncomingRequest<A: Account> {
    /// The account the request arrived from
    pub from: A,
    /// The prepare packet attached to the request
    pub prepare: Prepare,
}

impl<A> Debug for IncomingRequest<A>
where
    A: Account,
{
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("IncomingRequest")
            .field("prepare", &self.prepare)
            .field("from", &self.from)
            .finish()
    }
}

/// An ILP Prepare packet with both the ingress and egress accounts set.
#[derive(Clone)]
pub struct OutgoingRequest<A: Account> {
    /// The account the request arrived from
    pub from: A,
    /// The account the packet is being sent to
    pub to: A,
    /// The amount the packet carried on ingress, before any exchange-rate
    /// conversion
    pub original_amount: u64,
    /// The prepare packet attached to the request
    pub prepare: Prepare,
}

impl<A> Debug for OutgoingRequest<A>
where
    A: Account,
{
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("OutgoingRequest")
            .field("prepare", &self.prepare)
            .field("original_amount", &self.original_amount)
            .field("to", &self.to)
            .field("from", &self.from)
            .finish()
    }
}

impl<A> IncomingRequest<A>
where
    A: Account,
{
    /// Sets the egress account, turning this into an [`OutgoingRequest`].
    pub fn into_outgoing(self, to: A) -> OutgoingRequest<A> {
        OutgoingRequest {
            from: self.from,
            original_amount: self.prepare.amount(),
            prepare: self.prepare,
            to,
        }
    }
}

/// A service handling requests on their way in from a peer.
#[async_trait]
pub trait IncomingService<A: Account> {
    /// Handles the request, either by answering it directly or by
    /// (optionally modifying it and) passing it to the next service.
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult;

    /// Wrap the given service such that the provided function will be
    /// called to handle each request. The function can answer immediately,
    /// modify the request before passing it on, and/or post-process the
    /// inner service's response.
    fn wrap<F, R>(self, f: F) -> WrappedService<F, Self, A>
    where
        F: Send + Sync + Fn(IncomingRequest<A>, Box<dyn IncomingService<A> + Send>) -> R,
        R: Future<Output = IlpResult>,
        Self: Clone + Sized,
    {
        WrappedService::wrap_incoming(self, f)
    }
}

/// A service handling requests on their way out to a peer.
#[async_trait]
pub trait OutgoingService<A: Account> {
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult;

    /// Wrap the given service such that the provided function will be
    /// called to handle each request.
    fn wrap<F, R>(self, f: F) -> WrappedService<F, Self, A>
    where
        F: Send + Sync + Fn(OutgoingRequest<A>, Box<dyn OutgoingService<A> + Send>) -> R,
        R: Future<Output = IlpResult>,
        Self: Clone + Sized,
    {
        WrappedService::wrap_outgoing(self, f)
    }
}

/// Creates an [`IncomingService`] that calls the given handler for each
/// request. Mostly useful as the innermost service of a test chain.
pub fn incoming_service_fn<A, F>(handler: F) -> ServiceFn<F, A>
where
    A: Account,
    F: FnMut(IncomingRequest<A>) -> IlpResult,
{
    ServiceFn {
        handler,
        account_type: PhantomData,
    }
}

/// Creates an [`OutgoingService`] that calls the given handler for each
/// request.
pub fn outgoing_service_fn<A, F>(handler: F) -> ServiceFn<F, A>
where
    A: Account,
    F: FnMut(OutgoingRequest<A>) -> IlpResult,
{
    ServiceFn {
        handler,
        account_type: PhantomData,
    }
}

/// A service created by [`incoming_service_fn`] or [`outgoing_service_fn`]
#[derive(Clone)]
pub struct ServiceFn<F, A> {
    handler: F,
    account_type: PhantomData<A>,
}

#[async_trait]
impl<F, A> IncomingService<A> for ServiceFn<F, A>
where
    A: Account,
    F: FnMut(IncomingRequest<A>) -> IlpResult + Send,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        (self.handler)(request)
    }
}

#[async_trait]
impl<F, A> OutgoingService<A> for ServiceFn<F, A>
where
    A: Account,
    F: FnMut(OutgoingRequest<A>) -> IlpResult + Send,
{
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        (self.handler)(request)
    }
}

/// Looks up accounts by id.
#[async_trait]
pub trait AccountStore {
    /// The concrete account type. Must implement the [`Account`] trait.
    type Account: Account;

    async fn get_account(&self, account_id: &AccountId)
        -> Result<Self::Account, AccountStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AccountStoreError {
    #[error("account {0} was not found")]
    AccountNotFound(String),
    #[error("account store error: {0}")]
    Other(String),
}

/// Supplies the node's own ILP address, which stamps `triggered_by` on
/// locally-generated rejects and anchors loop prevention.
///
/// Reads are synchronous because every service on the hot path needs the
/// value.
pub trait AddressStore {
    fn get_ilp_address(&self) -> conductor_packet::Address;
}

/// A service that wraps another one with a function called on every
/// request, so one-off middlewares don't each need a struct and a trait
/// impl.
#[derive(Clone)]
pub struct WrappedService<F, I, A> {
    f: F,
    inner: Arc<I>,
    account_type: PhantomData<A>,
}

impl<F, I, A, R> WrappedService<F, I, A>
where
    F: Send + Sync + Fn(IncomingRequest<A>, Box<dyn IncomingService<A> + Send>) -> R,
    R: Future<Output = IlpResult>,
    I: IncomingService<A> + Clone,
    A: Account,
{
    pub fn wrap_incoming(inner: I, f: F) -> Self {
        WrappedService {
            f,
            inner: Arc::new(inner),
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<F, I, A, R> IncomingService<A> for WrappedService<F, I, A>
where
    F: Send + Sync + Fn(IncomingRequest<A>, Box<dyn IncomingService<A> + Send>) -> R,
    R: Future<Output = IlpResult> + Send + 'static,
    I: IncomingService<A> + Send + Sync + Clone + 'static,
    A: Account + Sync,
{
    async fn handle_request(&mut self, request: IncomingRequest<A>) -> IlpResult {
        (self.f)(request, Box::new((*self.inner).clone())).await
    }
}

impl<F, O, A, R> WrappedService<F, O, A>
where
    F: Send + Sync + Fn(OutgoingRequest<A>, Box<dyn OutgoingService<A> + Send>) -> R,
    R: Future<Output = IlpResult>,
    O: OutgoingService<A> + Clone,
    A: Account,
{
    pub fn wrap_outgoing(inner: O, f: F) -> Self {
        WrappedService {
            f,
            inner: Arc::new(inner),
            account_type: PhantomData,
        }
    }
}

#[async_trait]
impl<F, O, A, R> OutgoingService<A> for WrappedService<F, O, A>
where
    F: Send + Sync + Fn(OutgoingRequest<A>, Box<dyn OutgoingService<A> + Send>) -> R,
    R: Future<Output = IlpResult> + Send + 'static,
    O: OutgoingService<A> + Send + Sync + Clone + 'static,
    A: Account,
{
    async fn send_request(&mut self, request: OutgoingRequest<A>) -> IlpResult {
        (self.f)(request, Box::new((*self.inner).clone())).await
    }
}
