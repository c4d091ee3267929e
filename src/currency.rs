//! Supported account currencies
//!
//! Balances are integer minor units of the account's currency. There is no
//! conversion between currencies.

use validator::ValidationError;

pub const USD: &str = "USD";
pub const EUR: &str = "EUR";
pub const CAD: &str = "CAD";

/// Returns true if accounts may be opened in this currency
pub fn is_supported_currency(currency: &str) -> bool {
    matches!(currency, USD | EUR | CAD)
}

pub(crate) fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if is_supported_currency(currency) {
        Ok(())
    } else {
        Err(ValidationError::new("unsupported_currency"))
    }
}
