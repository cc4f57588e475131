//! Rewrites raw external-tool error text into fixed, client-safe messages.
//!
//! The raw text is logged by callers; only the output of [`sanitize`] ever
//! reaches a client.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ErrorClass;

pub const PERMISSION_MESSAGE: &str = "Error: Insufficient permissions to perform this operation.";
pub const GENERIC_MESSAGE: &str =
    "An error occurred while performing the operation. Please check VM name and try again.";

/// `The resource 'projects/<p>/zones/<z>/instances/<name>' was not found`
static RESOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r#"The resource 'projects/[^/]+/.*?instances/([^'"]+)'"#).expect("valid regex")
});

static INSTANCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r#"instances/([^'"\s]+)"#).expect("valid regex")
});

static PERMISSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)permission|authorized").expect("valid regex")
});

/// A client-safe error message and how it should be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub message: String,
    pub class: ErrorClass,
}

#[must_use]
pub fn not_found_message(vm: &str) -> String {
    format!("VM '{vm}' not found. Verify the name and zone.")
}

/// Classify raw error text. `fallback_vm` names the VM in a not-found message
/// when the text itself does not.
#[must_use]
pub fn sanitize(raw: &str, fallback_vm: &str) -> Sanitized {
    if let Some(caps) = RESOURCE_RE.captures(raw) {
        return not_found(caps.get(1).map_or(fallback_vm, |m| m.as_str()));
    }
    if raw.contains("HTTPError 404") && raw.contains("was not found") {
        let vm = INSTANCE_RE
            .captures(raw)
            .and_then(|c| c.get(1))
            .map_or(fallback_vm, |m| m.as_str());
        return not_found(vm);
    }
    if PERMISSION_RE.is_match(raw) {
        return Sanitized {
            message: PERMISSION_MESSAGE.to_string(),
            class: ErrorClass::Failure,
        };
    }
    Sanitized {
        message: GENERIC_MESSAGE.to_string(),
        class: ErrorClass::Failure,
    }
}

fn not_found(vm: &str) -> Sanitized {
    Sanitized {
        message: not_found_message(vm),
        class: ErrorClass::NotFound,
    }
}
