// Event model and correlation tokens
pub mod event;

// Event routing by message kind and correlation token
pub mod router;

// Per-user authorization lifecycle
pub mod identity;

// Response cache and replay
pub mod cache;

// Entitlement filtering and fan-out
pub mod entitlement;

// Service opening and exactly-once data requests
pub mod orchestrator;

// Provider session interface
pub mod transport;

// The dispatch loop tying everything together
pub mod distributor;

// TOML + environment configuration
pub mod config;
