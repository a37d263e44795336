//! Core library for the arbitrage-scanner project.
//!
//! Collects top-of-book quotes for trading pairs across many exchanges,
//! reconciles them per pair and derives cross-exchange arbitrage spreads.
//! The HTTP side of every venue is supplied through [`gateway::ExchangeGateway`];
//! streaming venues are spoken to directly by [`stream`].

pub mod aggregator;
pub mod arbitrage;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod errors;
pub mod fallback;
pub mod gateway;
pub mod models;
pub mod resolver;
pub mod scan;
pub mod session;
pub mod stream;
pub mod utils;
