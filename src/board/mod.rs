//! Board service: persistence, the HTTP boundary and server bootstrap.
//!
//! ```text
//! ┌────────┐  HTTP  ┌──────────────────────────────────────────────┐
//! │ Client │ ─────> │ server.rs  (build_router, serve)             │
//! │ Agent  │ <───── │   └─ api.rs  (handlers, AppState, ApiError)  │
//! └────────┘        │        │ mutations                           │
//!                   │        v                                     │
//!                   │ db.rs  (BoardDb via DbHandle)                │
//!                   │        │                                     │
//!                   │        v                                     │
//!                   │ events::EventLog  (record, then publish)     │
//!                   └──────────────────────────────────────────────┘
//! ```
//!
//! `actions` applies the allocator agent's corrective actions. `models` holds
//! the row types shared by all of the above.

pub mod actions;
pub mod api;
pub mod db;
pub mod models;
pub mod server;
