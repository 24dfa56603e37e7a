/// Protocol version announced in `version` messages.
pub const PROTOCOL_VERSION: u32 = 70000;
/// Service bit for a node that serves the full chain.
pub const NODE_NETWORK: u64 = 1;
/// Locator entries taken one height apart before the step starts doubling.
pub(crate) const LOCATOR_DENSE_STEPS: usize = 10;
pub(crate) const DEFAULT_REBROADCAST_SECS: u64 = 60;
