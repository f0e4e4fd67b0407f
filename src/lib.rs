//! # Homegate - Home Automation Gateway Engine
//!
//! Homegate is the protocol layer of a home-automation hub. It talks to two
//! serial devices and turns their traffic into application events:
//!
//! - **MySensors mesh**: a serial gateway board relaying a wireless sensor
//!   network. Homegate finds the board, waits for its startup handshake, decodes
//!   frames, answers time and config requests, and redelivers frames that asked
//!   for an acknowledgment.
//! - **GSM modem**: a SIM900 module. Homegate initializes it, sends queued SMS
//!   with an AT command sequence, and reports inbound SMS.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use homegate::config::Config;
//! use homegate::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//!     let gateway = Gateway::spawn_system(&config, tx)?;
//!     gateway.handle().send_sms("+33612345678", "Homegate started");
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`mesh`] - MySensors link, frame codec and acknowledgment retries
//! - [`modem`] - SIM900 link, AT sequencer and SMS extraction
//! - [`gateway`] - Tokio tasks driving both links, and the handle used to talk to them
//! - [`events`] - events delivered to the application
//! - [`serial`] - port enumeration and transport traits (real and mock)
//! - [`framer`] - newline framing shared by both links
//! - [`settings`] - small persisted key/value settings
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Application   │ ← events in, send_* calls out
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Gateway tasks  │ ← one Tokio task per link
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ MeshLink        │ ← synchronous state machines,
//! │ ModemLink       │   polled with the current time
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Serial ports  │
//! └─────────────────┘
//! ```

pub mod config;
pub mod events;
pub mod framer;
pub mod gateway;
pub mod logutil;
pub mod mesh;
pub mod metrics;
pub mod modem;
pub mod serial;
pub mod settings;
pub mod timer;
