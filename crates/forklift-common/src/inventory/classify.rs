//! Classification of inventory failures into retryable and permanent

/// Outcome of classifying an inventory failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    /// Retrying may succeed
    pub retryable: bool,
    /// Short description used in logs and error messages
    pub reason: &'static str,
}

impl Classification {
    const fn retryable(reason: &'static str) -> Self {
        Self {
            retryable: true,
            reason,
        }
    }

    const fn permanent(reason: &'static str) -> Self {
        Self {
            retryable: false,
            reason,
        }
    }
}

/// Extract the HTTP status from a message containing `status: NNN`.
///
/// Returns 0 when there is no status or it is not a number.
pub fn extract_http_status(message: &str) -> u16 {
    let Some(idx) = message.find("status:") else {
        return 0;
    };
    message[idx + "status:".len()..]
        .split_whitespace()
        .next()
        .and_then(|s| s.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
        .unwrap_or(0)
}

/// Classify an inventory failure from its message
pub fn classify(message: &str) -> Classification {
    let lower = message.to_lowercase();
    match extract_http_status(message) {
        401 | 403 => return Classification::permanent("authentication/authorization error"),
        400 => return Classification::permanent("bad request"),
        405 => return Classification::permanent("method not allowed"),
        404 if lower.contains("not found") => {
            return Classification::permanent("resource not found")
        }
        404 => return Classification::retryable("inventory service unavailable"),
        502..=504 => return Classification::retryable("service unavailable"),
        429 => return Classification::retryable("rate limited"),
        _ => {}
    }

    const NETWORK: &[&str] = &["connection", "timeout", "timed out", "network", "unreachable"];
    if NETWORK.iter().any(|k| lower.contains(k)) {
        return Classification::retryable("network connectivity issue");
    }

    Classification::retryable("unknown error, defaulting to retryable")
}
