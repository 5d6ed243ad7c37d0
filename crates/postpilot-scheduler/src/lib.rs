//! `postpilot-scheduler`: durable scheduling and delivery of posts to
//! multiple platforms, backed by SQLite.
//!
//! # Overview
//!
//! Submitted posts are stored in the `scheduled_posts` table. The
//! [`daemon::DeliveryDaemon`] polls for pending posts whose time has come and
//! publishes each one to every target platform through the
//! [`PublisherRegistry`](postpilot_publishers::PublisherRegistry), recording
//! per-platform results so a retry never republishes a platform that already
//! succeeded.
//!
//! # Lifecycle
//!
//! | From         | To           | When                                        |
//! |--------------|--------------|---------------------------------------------|
//! | `pending`    | `processing` | due and within the grace period             |
//! | `processing` | `completed`  | every platform published                    |
//! | `processing` | `pending`    | some platform failed, retries remain        |
//! | `processing` | `failed`     | some platform failed, retries exhausted     |
//! | `pending`    | `failed`     | later than the grace period                 |
//! | non-terminal | `cancelled`  | operator cancel                             |

pub mod control;
pub mod daemon;
pub mod db;
pub mod engine;
pub mod error;
pub mod slots;
pub mod store;
pub mod submit;
pub mod timestamp;
pub mod types;

pub use control::{ControlApi, FailedPost, PostDetail, UpcomingPost};
pub use daemon::{DeliveryDaemon, PublishOutcome, TickReport, MISSED_ERROR};
pub use engine::Engine;
pub use error::{Result, SchedulerError};
pub use slots::SlotAllocator;
pub use store::PostStore;
pub use submit::Submitter;
pub use types::{
    Claim, Commitments, FailureEntry, NewPost, PlatformResult, PostEvent, PostFilter,
    ScheduledPost, StatusUpdate, TimeWindow,
};
