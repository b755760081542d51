//! Operation context.
//!
//! Caller identity and tracing metadata travelling with every engine call.
//! Identity is established by an external provider; the engine trusts the
//! caller id and role it is handed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Caller role as asserted by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Operator,
}

impl Role {
    pub fn is_operator(&self) -> bool {
        matches!(self, Role::Operator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Customer => write!(f, "customer"),
            Role::Operator => write!(f, "operator"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "operator" => Ok(Role::Operator),
            other => Err(format!("unknown role: {other:?}")),
        }
    }
}

/// Context for one ledger operation.
///
/// Carries the audit identity written into every ledger entry plus the
/// cancellation token the engine consults before its first committed write.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub caller_id: Uuid,
    pub role: Role,
    pub correlation_id: Uuid,
    cancellation: CancellationToken,
}

impl OperationContext {
    /// Create a context with a fresh correlation id and a token that never
    /// fires.
    pub fn new(caller_id: Uuid, role: Role) -> Self {
        Self {
            caller_id,
            role,
            correlation_id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// True once the caller has abandoned the operation. Only consulted
    /// before the first committed write; a started commit always runs to
    /// completion or compensation.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
