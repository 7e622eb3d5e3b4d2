//! Queue change notifications.
//!
//! The queue monitor wakes on PostgreSQL NOTIFY rather than polling. Every
//! channel the runner consumes is listed here; unknown channels are ignored
//! so schema-side additions do not break older runners.

use crate::error::DbResult;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::warn;

/// A change to the queue, decoded from the notification channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueChange {
    BuildsAdded,
    BuildsRestarted,
    BuildsCancelled,
    BuildsDeleted,
    BuildsBumped,
    JobsetSharesChanged,
    DumpStatus,
}

impl QueueChange {
    fn from_channel(channel: &str) -> Option<Self> {
        Some(match channel {
            "builds_added" => Self::BuildsAdded,
            "builds_restarted" => Self::BuildsRestarted,
            "builds_cancelled" => Self::BuildsCancelled,
            "builds_deleted" => Self::BuildsDeleted,
            "builds_bumped" => Self::BuildsBumped,
            "jobset_shares_changed" => Self::JobsetSharesChanged,
            "dump_status" => Self::DumpStatus,
            _ => return None,
        })
    }

    pub const CHANNELS: &'static [&'static str] = &[
        "builds_added",
        "builds_restarted",
        "builds_cancelled",
        "builds_deleted",
        "builds_bumped",
        "jobset_shares_changed",
        "dump_status",
    ];
}

pub struct QueueListener {
    inner: PgListener,
}

impl QueueListener {
    pub async fn connect(pool: &PgPool) -> DbResult<Self> {
        let mut inner = PgListener::connect_with(pool).await?;
        inner.listen_all(QueueChange::CHANNELS.iter().copied()).await?;
        Ok(Self { inner })
    }

    /// Wait for the next queue change. Reconnections inside the listener are
    /// transparent; a reconnect may have missed notifications, which is fine
    /// because the monitor reloads the full pending set on every wakeup.
    pub async fn recv(&mut self) -> DbResult<QueueChange> {
        loop {
            let notification = self.inner.recv().await?;
            match QueueChange::from_channel(notification.channel()) {
                Some(change) => return Ok(change),
                None => {
                    warn!(channel = notification.channel(), "ignoring unknown notification");
                }
            }
        }
    }
}
