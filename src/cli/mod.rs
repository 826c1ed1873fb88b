//! Command-line interface

use clap::Parser;

/// One invocation synchronizes one tenant.
#[derive(Debug, Parser)]
#[command(name = "outbound-sync")]
#[command(about = "Synchronize a tenant's outbound data feeds and hand off the file drop")]
pub struct Cli {
    /// Tenant code identifying the customer to synchronize
    pub customer: String,

    /// Run-group naming the subset of resources to process
    #[arg(default_value = "ALL")]
    pub run_group: String,

    /// Upload the file drop to the downstream system when set to Y
    #[arg(default_value = "N")]
    pub send: String,
}

impl Cli {
    pub fn send_requested(&self) -> bool {
        self.send.eq_ignore_ascii_case("Y")
    }
}
