// src/supervisor/mod.rs
//! Worker supervisor
//!
//! Host-side management of the agent runtime worker:
//!
//! ```text
//! ┌──────────────────────── host process ────────────────────────┐
//! │ caller ──▶ WorkerSupervisor ──▶ WorkerConnection ──┐         │
//! │               │  ▲                 (pending calls) │         │
//! │     monitor ──┘  └── SupervisorEvent broadcast     │         │
//! └────────────────────────────────────────────────────┼─────────┘
//!                                   newline-delimited  │ JSON
//! ┌──────────────────────── worker ────────────────────▼─────────┐
//! │ serve() ──▶ RuntimeSession ──▶ AgentEngine (ReAct / CoAct)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Process Manager**: spawns and signals the worker binary
//! - **Launcher**: OS process or in-process worker behind one trait
//! - **Connection**: request correlation and stream multiplexing
//! - **Health**: ping probe record and the unhealthy policy
//! - **Worker**: lifecycle, restart policy and the caller API

pub mod connection;
pub mod health;
pub mod launcher;
pub mod process_manager;
pub mod worker;

pub use connection::WorkerConnection;
pub use health::WorkerHealth;
pub use launcher::{LocalLauncher, ProcessLauncher, WorkerChannel, WorkerControl, WorkerLauncher};
pub use process_manager::ProcessManager;
pub use worker::{SupervisorEvent, SupervisorStatus, WorkerSupervisor};
