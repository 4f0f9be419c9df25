use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::{CredentialError, InvokeError, TunnelError};
use crate::sys::invoker::{InvocationDescriptor, Outcome};
use crate::sys::secrets::{ProviderCredential, SecretKind};

// ==============================================================================
// 1. Secret Retrieval (Zero-Leak Auth)
// ==============================================================================

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetches one secret from the external store. Implementations never
    /// cache; every call goes back to the store.
    async fn get_secret(&self, kind: SecretKind) -> Result<ProviderCredential, CredentialError>;
}

// ==============================================================================
// 2. Delegated Execution
// ==============================================================================

#[async_trait]
pub trait ProcessInvoker: Send + Sync {
    /// Runs the descriptor to completion with stdout handed to the child.
    /// Takes the descriptor by value: once handed over it is never touched
    /// again, and any secret it carries is zeroized when the call returns.
    async fn invoke(&self, descriptor: InvocationDescriptor) -> Result<Outcome, InvokeError>;
}

// ==============================================================================
// 3. Secure Forwarding
// ==============================================================================

#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn TunnelSession>, TunnelError>;
}

/// A live forward. Only `TunnelManager` closes sessions; dropping one without
/// `close` must still tear the forward down.
#[async_trait]
pub trait TunnelSession: Send {
    fn local_endpoint(&self) -> SocketAddr;
    fn remote_endpoint(&self) -> &str;
    async fn close(self: Box<Self>) -> Result<(), TunnelError>;
}

// ==============================================================================
// 4. Object Storage (delegated transfer runtime)
// ==============================================================================

#[async_trait]
pub trait ObjectTransfer: Send + Sync {
    /// Runs the storage API proxy until it exits.
    async fn serve_proxy(&self) -> Result<Outcome, InvokeError>;

    async fn upload(
        &self,
        source: &str,
        destination: &str,
        content_type: &str,
    ) -> Result<Outcome, InvokeError>;

    async fn download(&self, source: &str, destination: &str) -> Result<Outcome, InvokeError>;
}
