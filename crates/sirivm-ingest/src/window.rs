//! Extraction window selection
//!
//! Objects strictly newer than `now - lookback` are selected. The listing is
//! followed to exhaustion; a failure on any page aborts the run, since a
//! partial window cannot be told apart from a complete one.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::storage::{ObjectStore, ObjectSummary};

/// Listed object selected for extraction
pub type SourceObjectDescriptor = ObjectSummary;

/// The selected window: its cutoff and the objects that fall after it
#[derive(Debug, Clone)]
pub struct Window {
    pub cutoff: DateTime<Utc>,
    pub objects: Vec<SourceObjectDescriptor>,
    /// Objects listed in total, inside and outside the window
    pub listed: usize,
}

#[derive(Debug, Clone)]
pub struct WindowSelector {
    prefix: String,
    lookback: Duration,
}

impl WindowSelector {
    pub fn new(prefix: impl Into<String>, lookback: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            lookback,
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.lookback
    }

    /// List every object under the prefix and keep those modified after the cutoff
    ///
    /// A key returned twice by the listing (e.g. across a page boundary) is
    /// selected once.
    pub async fn select(&self, store: &dyn ObjectStore, now: DateTime<Utc>) -> Result<Window> {
        let cutoff = self.cutoff(now);
        let mut cursor: Option<String> = None;
        let mut visited_cursors = HashSet::new();
        let mut seen = HashSet::new();
        let mut objects = Vec::new();
        let mut listed = 0usize;
        let mut pages = 0usize;

        loop {
            let page = store
                .list_page(&self.prefix, cursor.as_deref())
                .await
                .map_err(|source| IngestError::Listing {
                    prefix: self.prefix.clone(),
                    source,
                })?;
            pages += 1;
            listed += page.objects.len();

            for object in page.objects {
                if object.last_modified <= cutoff {
                    continue;
                }
                if !seen.insert(object.key.clone()) {
                    warn!(source = %object.key, "Object listed more than once, keeping first");
                    continue;
                }
                objects.push(object);
            }

            match page.next_cursor {
                Some(next) if !visited_cursors.insert(next.clone()) => {
                    return Err(IngestError::Listing {
                        prefix: self.prefix.clone(),
                        source: anyhow::anyhow!("listing cursor '{}' was already visited", next),
                    });
                },
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(pages, listed, "Listing exhausted");
        info!(
            prefix = %self.prefix,
            cutoff = %cutoff,
            listed,
            selected = objects.len(),
            "Selected extraction window"
        );

        Ok(Window {
            cutoff,
            objects,
            listed,
        })
    }
}
