//! Audit Taxonomies
//!
//! Closed enumerations shared between producers and the ledger. Each
//! variant has a stable wire tag; the tag (not the Rust name) is what
//! enters the canonical encoding, so tags must never be renamed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AuditError;

/// Bumped whenever variants are added to [`AuditAction`].
pub const ACTION_TAXONOMY_VERSION: u32 = 1;

macro_rules! tagged_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal, $case:literal {
            $($variant:ident => $tag:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = $case)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }
        }

        impl FromStr for $name {
            type Err = AuditError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok($name::$variant),)+
                    other => Err(AuditError::validation(
                        $field,
                        format!("unknown value '{}'", other),
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

tagged_enum! {
    /// Security-relevant actions recorded by the platform.
    AuditAction, "action", "SCREAMING_SNAKE_CASE" {
        Login => "LOGIN",
        Logout => "LOGOUT",
        LoginFailed => "LOGIN_FAILED",
        AccessDenied => "ACCESS_DENIED",
        PermissionChanged => "PERMISSION_CHANGED",
        ApiKeyCreated => "API_KEY_CREATED",
        ApiKeyRevoked => "API_KEY_REVOKED",
        FreezeWallet => "FREEZE_WALLET",
        UnfreezeWallet => "UNFREEZE_WALLET",
        FlagTransaction => "FLAG_TRANSACTION",
        ClearTransactionFlag => "CLEAR_TRANSACTION_FLAG",
        IssueLicense => "ISSUE_LICENSE",
        SuspendLicense => "SUSPEND_LICENSE",
        RevokeLicense => "REVOKE_LICENSE",
        RegisterMiner => "REGISTER_MINER",
        DeregisterMiner => "DEREGISTER_MINER",
        CreateComplianceRule => "CREATE_COMPLIANCE_RULE",
        UpdateComplianceRule => "UPDATE_COMPLIANCE_RULE",
        DeleteComplianceRule => "DELETE_COMPLIANCE_RULE",
        RunComplianceCheck => "RUN_COMPLIANCE_CHECK",
        GenerateReport => "GENERATE_REPORT",
        SubmitReport => "SUBMIT_REPORT",
        ExportData => "EXPORT_DATA",
        UpdateConfiguration => "UPDATE_CONFIGURATION",
        VerifyChain => "VERIFY_CHAIN",
    }
}

tagged_enum! {
    ActorType, "actor_type", "lowercase" {
        User => "user",
        Service => "service",
        System => "system",
    }
}

tagged_enum! {
    Outcome, "outcome", "lowercase" {
        Success => "success",
        Failure => "failure",
        Partial => "partial",
    }
}

tagged_enum! {
    Severity, "severity", "lowercase" {
        Info => "info",
        Warning => "warning",
        Error => "error",
        Critical => "critical",
    }
}
