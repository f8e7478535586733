pub mod auth;
pub mod config;
pub mod connect;
pub mod credentials;
pub mod error;
pub mod krb5;
pub mod logwriter;
pub mod pac;
pub mod proxy;
pub mod selector;

pub use auth::Auth;
pub use config::DynamicConfig;
pub use credentials::{Credentials, CredentialStore};
pub use error::ProxyError;
pub use proxy::{ProxyServer, Timeouts};
pub use selector::UpstreamSelector;
