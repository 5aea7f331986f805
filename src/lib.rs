//! Pledge Scheduler - recurring donation billing for community tenants
//!
//! Periodically charges donors on their pledge schedule, records every
//! attempt in an append-only ledger, and pauses pledges whose payment
//! method keeps failing.
//!
//! ## Architecture
//!
//! ```text
//! PledgeScheduler (due sweep / retry sweep)
//!        │
//!        ▼
//! PledgeProcessor ──► PaymentGateway
//!        │
//!        ├──► PledgeDb (charges, donations, pledge state)
//!        ├──► EventBus
//!        └──► Notifier (receipts, failure notices)
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/pledge-scheduler/
//! ├── pledges.db             # SQLite (pledges, charges, donation_records)
//! └── config.toml            # Configuration
//! ```
//!
//! ## Pledge States
//!
//! | Status | Selected by sweeps | Left by |
//! |--------|--------------------|---------|
//! | ACTIVE | yes | pause threshold, end date, cancel |
//! | FAILED | no | resume |
//! | PAUSED | no | resume |
//! | CANCELLED | no | terminal |
//! | COMPLETED | no | terminal |

pub mod calendar;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod notify;
pub mod outcome;
pub mod processor;
pub mod scheduler;
pub mod settings;

// Re-exports
pub use calendar::{next_charge_date, Frequency};
pub use config::Config;
pub use db::{PledgeDb, TenantContext};
pub use error::{BillingError, Result};
pub use events::{BillingEvent, EventBus};
pub use gateway::{GatewayResponse, MockGateway, PaymentGateway, SandboxGateway};
pub use notify::{LogNotifier, Notifier, RecordingNotifier};
pub use outcome::{BatchSummary, ChargeOutcome};
pub use processor::{PledgeProcessor, ProcessorConfig};
pub use scheduler::{PledgeScheduler, SweepReport};
pub use settings::{SettingsCache, TenantPledgeSettings};
