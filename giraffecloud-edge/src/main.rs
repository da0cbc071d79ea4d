//! GiraffeCloud edge server.
//!
//! Terminates public traffic for user-owned domains and relays each request
//! to the agent connected for that domain over a multiplexed tunnel stream.
//!
//! Modules:
//! - [`registry`]  — domain to live-session map
//! - [`session`]   — per-agent stream ownership, demultiplexing, liveness
//! - [`dispatch`]  — public request path: classify, transmit, collect, meter
//! - [`usage`] / [`quota`] — on-path metering and quota decisions
//! - [`store`]     — tunnels/usage/plans persistence
//! - [`api`]       — control-plane REST and the front-door ask-endpoint

mod api;
mod app;
mod audit;
mod config;
mod dispatch;
mod error;
mod quota;
mod registry;
mod session;
mod state;
mod store;
mod subdomain;
mod usage;

use clap::Parser;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    app::run(config).await
}
