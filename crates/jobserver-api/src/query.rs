// ABOUTME: Request and response shapes for the JobServer history endpoints.
// ABOUTME: Defaults match the public API: newest first, 25 items per page, page 1.

use jobserver_core::{ErrorSeverity, JobState, TimestampInput};
use jobserver_store::{Filter, Query};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

fn default_descending() -> bool {
    true
}

fn default_items_per_page() -> u32 {
    25
}

fn default_page() -> u32 {
    1
}

/// A before/after window plus paging, shared by every list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindowQuery {
    #[serde(default)]
    pub before: Option<TimestampInput>,
    #[serde(default)]
    pub after: Option<TimestampInput>,
    #[serde(default = "default_descending")]
    pub descending: bool,
    #[serde(default = "default_items_per_page")]
    pub items_per_page: u32,
    #[serde(default = "default_page")]
    pub page: u32,
}

impl Default for TimeWindowQuery {
    fn default() -> Self {
        Self {
            before: None,
            after: None,
            descending: default_descending(),
            items_per_page: default_items_per_page(),
            page: default_page(),
        }
    }
}

impl TimeWindowQuery {
    /// Lower to a store query windowed on `time_field`.
    pub(crate) fn to_query(&self, time_field: &str) -> Result<Query, ApiError> {
        let mut query = Query::new()
            .descending(self.descending)
            .paginate(self.items_per_page, self.page);
        if let Some(before) = &self.before {
            query = query.filter(Filter::before(time_field, before.normalize()?));
        }
        if let Some(after) = &self.after {
            query = query.filter(Filter::after(time_field, after.normalize()?));
        }
        Ok(query)
    }

    pub(crate) fn page<T>(&self, items: Vec<T>) -> Page<T> {
        Page {
            items,
            page: self.page,
            items_per_page: self.items_per_page,
            descending: self.descending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorQuery {
    #[serde(flatten)]
    pub window: TimeWindowQuery,
    #[serde(default)]
    pub severity_level: Option<ErrorSeverity>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub client_token: Option<String>,
    #[serde(default)]
    pub include_traceback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdateQuery {
    #[serde(flatten)]
    pub window: TimeWindowQuery,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub client_token: Option<String>,
    #[serde(default)]
    pub state: Option<JobState>,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub items_per_page: u32,
    pub descending: bool,
}

/// Window an in-memory list the same way the store windows a search.
pub(crate) fn paginate<T>(items: Vec<T>, items_per_page: u32, page: u32) -> Vec<T> {
    if items_per_page == 0 || page == 0 {
        return items;
    }
    let per_page = items_per_page as usize;
    let start = (page as usize - 1).saturating_mul(per_page);
    items.into_iter().skip(start).take(per_page).collect()
}
