pub mod auth;
pub mod config;
pub mod control;
pub mod crash_insights;
pub mod dedup;
pub mod events;
pub mod lifecycle;
pub mod message_bridge;
pub mod metrics;
pub mod protocol;
pub mod pty;
pub mod relaycast_ws;
pub mod replay_buffer;
pub mod snippets;
pub mod supervisor;
pub mod swarm;
pub mod telemetry;
pub mod types;
