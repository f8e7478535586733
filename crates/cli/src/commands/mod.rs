pub mod auth;
pub mod krb5;
pub mod proxy;

pub const DEFAULT_SERVICE: &str = "squiggly";
