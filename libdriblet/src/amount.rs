use bitcoin::Amount;

/// The floor below which an output is considered dust and will not relay.
pub const MIN_NONDUST_OUTPUT: u64 = 546;

/// The reference client's default minimum transaction fee, in satoshis.
pub const REFERENCE_DEFAULT_MIN_TX_FEE: u64 = 10_000;

/// One hundredth of a bitcoin. Channels funded below this pay a fee out of the refund.
pub const CENT: u64 = 1_000_000;

/// Returns true if an output of `value` would be rejected by the network as dust.
pub fn is_dust(value: Amount) -> bool {
    value.to_sat() < MIN_NONDUST_OUTPUT
}

/// The smallest output value the network will relay.
pub fn min_nondust_output() -> Amount {
    Amount::from_sat(MIN_NONDUST_OUTPUT)
}
