//! Credential pool with quota enforcement and rotation.
//!
//! - **Credential**: a secret with a daily quota, an expiry and a fault counter
//! - **CredentialPool**: selection, rotation and feedback over a set of credentials
//! - **CredentialStore**: write-through durability for pool state
//! - **parse_credentials**: intake of secrets from operator-supplied files
//!
//! # Example
//!
//! ```rust,ignore
//! use quotaflow::credentials::{Acquisition, CredentialPool, PoolConfig};
//!
//! let pool = CredentialPool::new(PoolConfig::default());
//! pool.add("secret", None).await?;
//!
//! match pool.acquire_rotating(None, 15).await {
//!     Acquisition::Granted { id, secret } => { /* call the resource */ }
//!     Acquisition::Exhausted => { /* back off */ }
//! }
//! ```

pub mod credential;
pub mod parse;
pub mod pool;
pub mod store;

pub use credential::{generate_credential_id, Credential, CredentialDetail};
pub use parse::parse_credentials;
pub use pool::{
    Acquisition, BulkAddEntry, BulkAddReport, CredentialPool, PoolConfig, PoolError, PoolStatus,
};
pub use store::{
    CredentialSource, CredentialStore, FileCredentialSource, MemoryCredentialStore, SourceError,
    StoreError,
};
