pub mod args;

/// Exit codes for different error conditions
pub mod exit_codes {
    /// Clean shutdown
    pub const SUCCESS: u8 = 0;
    /// Could not bind or accept (address in use, permission denied)
    pub const NETWORK_ERROR: u8 = 1;
    /// The relay failed to start
    pub const RELAY_ERROR: u8 = 3;
}
