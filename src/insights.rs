//! Read-only aggregation over the coordinator's output: the weekly
//! leaderboard and the standout submission. No concurrency concerns here,
//! everything reads finalized rows.

use std::sync::Arc;

use crate::error::StoreResult;
use crate::store::WeekStore;
use crate::{LeaderboardEntry, Submission};

#[derive(Debug, Clone)]
pub struct WeeklyInsights {
    pub week: i32,
    pub top_performers: Vec<LeaderboardEntry>,
    pub top_submission: Option<Submission>,
}

pub struct InsightsService {
    weeks: Arc<dyn WeekStore>,
}

impl InsightsService {
    pub fn new(weeks: Arc<dyn WeekStore>) -> Self {
        InsightsService { weeks }
    }

    pub async fn weekly_insights(&self, week: i32, top_n: i64) -> StoreResult<WeeklyInsights> {
        let top_performers = self.weeks.weekly_leaderboard(week, top_n).await?;
        let top_submission = self.weeks.top_submission(week).await?;
        Ok(WeeklyInsights {
            week,
            top_performers,
            top_submission,
        })
    }
}
