//! Opal cluster RPC contract
//!
//! The semantic operations peers and admin tools exchange, as versioned,
//! token-authenticated message types plus service traits. Transports are
//! deliberately absent: any carrier that can move these messages and
//! call the traits implements the cluster protocol. The local receivers
//! apply the operations against this process's object layer and context.

pub mod admin;
pub mod peer;

pub use admin::{AdminService, LocalAdminReceiver, ServerInfoReply};
pub use peer::{LocalPeerReceiver, PeerService};

use serde::{Deserialize, Serialize};

use opal_common::error::{Error, Result};

/// Protocol version; both sides must agree exactly.
pub const RPC_VERSION: &str = "1";

/// Authentication envelope carried by every request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthArgs {
    pub token: String,
    pub version: String,
}

impl AuthArgs {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            version: RPC_VERSION.to_string(),
        }
    }

    /// Reject mismatched versions before looking at the token, so old
    /// peers get a precise error instead of an auth failure.
    pub fn validate(&self, expected_token: &str) -> Result<()> {
        if self.version != RPC_VERSION {
            return Err(Error::RpcVersionMismatch {
                expected: RPC_VERSION.to_string(),
                got: self.version.clone(),
            });
        }
        if self.token != expected_token {
            return Err(Error::AuthFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_checked_before_token() {
        let mut args = AuthArgs::new("secret");
        args.version = "0".into();
        assert!(matches!(
            args.validate("other"),
            Err(Error::RpcVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_token_mismatch() {
        let args = AuthArgs::new("secret");
        assert!(matches!(args.validate("other"), Err(Error::AuthFailed)));
        assert!(args.validate("secret").is_ok());
    }
}
