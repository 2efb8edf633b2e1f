// Authentication module
// Token store, interactive login and per-scope token minting

mod acquirer;
mod browser;
mod exchange;
mod minter;
mod store;
pub mod types;

pub use acquirer::{AcquireState, CredentialAcquirer};
pub use browser::{ChromeLoginDriver, LoginDriver};
pub use exchange::post_aggregate_settings;
pub use minter::TokenMinter;
pub use store::TokenStore;
pub use types::{Scope, StoredEntry, TokenRecord};
